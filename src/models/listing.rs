use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Latitude/longitude pair. Coordinates are stored together or not at all.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Location information for a listing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub country: Option<String>,
    pub coordinates: Option<GeoPoint>,
}

/// A business-for-sale record as produced by a scraper.
///
/// Money fields are whole cents. `None` means the source did not disclose the
/// figure, which is not the same thing as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub external_id: String,
    pub url: String,
    pub title: String,
    pub description: Option<String>,

    pub asking_price: Option<i64>,
    pub revenue: Option<i64>,
    pub cash_flow: Option<i64>,
    pub ebitda: Option<i64>,
    pub inventory_value: Option<i64>,
    pub real_estate_included: bool,
    pub real_estate_value: Option<i64>,
    pub monthly_rent: Option<i64>,

    pub location: Location,

    pub industry: Option<String>,
    pub industry_category: Option<String>,
    pub business_type: Option<String>,
    pub year_established: Option<i32>,
    pub employees: Option<i32>,
    pub reason_for_sale: Option<String>,
    pub is_franchise: bool,
    pub franchise_name: Option<String>,

    pub raw_data: serde_json::Value,
}

impl Listing {
    pub fn new(external_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    /// A record can only be merged if it can be keyed and displayed.
    pub fn is_identifiable(&self) -> bool {
        !self.external_id.trim().is_empty() && !self.title.trim().is_empty()
    }
}

/// A listing as persisted: the scraped fields plus store-owned identity and
/// freshness tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub id: Uuid,
    pub source_id: Uuid,
    #[serde(flatten)]
    pub listing: Listing,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub is_active: bool,
}

impl ListingRecord {
    pub fn external_id(&self) -> &str {
        &self.listing.external_id
    }
}
