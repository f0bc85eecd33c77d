use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::info;
use uuid::Uuid;

use super::{JobStore, ListingStore, SourceStore, StoreResult, TriggerStore};
use crate::error::{StoreError, TransitionError};
use crate::merge::UpsertOutcome;
use crate::models::{
    GeoPoint, JobCounters, JobStatus, Listing, ListingRecord, Location, ScrapeJob, Source,
};

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[derive(FromRow)]
struct ListingRow {
    id: Uuid,
    source_id: Uuid,
    external_id: String,
    url: String,
    title: String,
    description: Option<String>,
    asking_price: Option<i64>,
    revenue: Option<i64>,
    cash_flow: Option<i64>,
    ebitda: Option<i64>,
    inventory_value: Option<i64>,
    real_estate_included: bool,
    real_estate_value: Option<i64>,
    monthly_rent: Option<i64>,
    city: Option<String>,
    state: Option<String>,
    zip_code: Option<String>,
    country: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    industry: Option<String>,
    industry_category: Option<String>,
    business_type: Option<String>,
    year_established: Option<i32>,
    employees: Option<i32>,
    reason_for_sale: Option<String>,
    is_franchise: bool,
    franchise_name: Option<String>,
    raw_data: serde_json::Value,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    is_active: bool,
}

impl From<ListingRow> for ListingRecord {
    fn from(row: ListingRow) -> Self {
        let coordinates = match (row.latitude, row.longitude) {
            (Some(lat), Some(lng)) => Some(GeoPoint { lat, lng }),
            _ => None,
        };
        ListingRecord {
            id: row.id,
            source_id: row.source_id,
            listing: Listing {
                external_id: row.external_id,
                url: row.url,
                title: row.title,
                description: row.description,
                asking_price: row.asking_price,
                revenue: row.revenue,
                cash_flow: row.cash_flow,
                ebitda: row.ebitda,
                inventory_value: row.inventory_value,
                real_estate_included: row.real_estate_included,
                real_estate_value: row.real_estate_value,
                monthly_rent: row.monthly_rent,
                location: Location {
                    city: row.city,
                    state: row.state,
                    zip_code: row.zip_code,
                    country: row.country,
                    coordinates,
                },
                industry: row.industry,
                industry_category: row.industry_category,
                business_type: row.business_type,
                year_established: row.year_established,
                employees: row.employees,
                reason_for_sale: row.reason_for_sale,
                is_franchise: row.is_franchise,
                franchise_name: row.franchise_name,
                raw_data: row.raw_data,
            },
            first_seen_at: row.first_seen_at,
            last_seen_at: row.last_seen_at,
            is_active: row.is_active,
        }
    }
}

#[derive(FromRow)]
struct SourceRow {
    id: Uuid,
    name: String,
    slug: String,
    base_url: String,
    scraper_kind: String,
    is_active: bool,
    config: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SourceRow> for Source {
    type Error = StoreError;

    fn try_from(row: SourceRow) -> Result<Self, Self::Error> {
        Ok(Source {
            id: row.id,
            name: row.name,
            slug: row.slug,
            base_url: row.base_url,
            scraper_kind: row.scraper_kind.parse().map_err(StoreError::Corrupt)?,
            is_active: row.is_active,
            config: row.config,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    source_id: Uuid,
    status: String,
    full_scrape: bool,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    listings_found: i32,
    listings_new: i32,
    listings_updated: i32,
    error_message: Option<String>,
}

impl TryFrom<JobRow> for ScrapeJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let count = |n: i32| u32::try_from(n).unwrap_or(0);
        Ok(ScrapeJob {
            id: row.id,
            source_id: row.source_id,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            full_scrape: row.full_scrape,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            counters: JobCounters {
                found: count(row.listings_found),
                new: count(row.listings_new),
                updated: count(row.listings_updated),
            },
            error_message: row.error_message,
        })
    }
}

const SOURCE_COLUMNS: &str =
    "id, name, slug, base_url, scraper_kind, is_active, config, created_at, updated_at";

const JOB_COLUMNS: &str = "id, source_id, status, full_scrape, created_at, started_at, \
    completed_at, listings_found, listings_new, listings_updated, error_message";

fn counter(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[async_trait]
impl ListingStore for PgStore {
    async fn upsert(
        &self,
        source_id: Uuid,
        listing: &Listing,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<UpsertOutcome> {
        let location = &listing.location;
        let (id, inserted): (Uuid, bool) = sqlx::query_as(
            r#"
            INSERT INTO listings (
                id, source_id, external_id, url, title, description,
                asking_price, revenue, cash_flow, ebitda, inventory_value,
                real_estate_included, real_estate_value, monthly_rent,
                city, state, zip_code, country, latitude, longitude,
                industry, industry_category, business_type, year_established,
                employees, reason_for_sale, is_franchise, franchise_name, raw_data,
                first_seen_at, last_seen_at, is_active
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28,
                $29, $30, $30, TRUE
            )
            ON CONFLICT (source_id, external_id) DO UPDATE SET
                url = EXCLUDED.url,
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                asking_price = EXCLUDED.asking_price,
                revenue = EXCLUDED.revenue,
                cash_flow = EXCLUDED.cash_flow,
                ebitda = EXCLUDED.ebitda,
                inventory_value = EXCLUDED.inventory_value,
                real_estate_included = EXCLUDED.real_estate_included,
                real_estate_value = EXCLUDED.real_estate_value,
                monthly_rent = EXCLUDED.monthly_rent,
                city = EXCLUDED.city,
                state = EXCLUDED.state,
                zip_code = EXCLUDED.zip_code,
                country = EXCLUDED.country,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                industry = EXCLUDED.industry,
                industry_category = EXCLUDED.industry_category,
                business_type = EXCLUDED.business_type,
                year_established = EXCLUDED.year_established,
                employees = EXCLUDED.employees,
                reason_for_sale = EXCLUDED.reason_for_sale,
                is_franchise = EXCLUDED.is_franchise,
                franchise_name = EXCLUDED.franchise_name,
                raw_data = EXCLUDED.raw_data,
                last_seen_at = GREATEST(listings.last_seen_at, EXCLUDED.last_seen_at),
                is_active = TRUE
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(source_id)
        .bind(&listing.external_id)
        .bind(&listing.url)
        .bind(&listing.title)
        .bind(&listing.description)
        .bind(listing.asking_price)
        .bind(listing.revenue)
        .bind(listing.cash_flow)
        .bind(listing.ebitda)
        .bind(listing.inventory_value)
        .bind(listing.real_estate_included)
        .bind(listing.real_estate_value)
        .bind(listing.monthly_rent)
        .bind(&location.city)
        .bind(&location.state)
        .bind(&location.zip_code)
        .bind(&location.country)
        .bind(location.coordinates.map(|c| c.lat))
        .bind(location.coordinates.map(|c| c.lng))
        .bind(&listing.industry)
        .bind(&listing.industry_category)
        .bind(&listing.business_type)
        .bind(listing.year_established)
        .bind(listing.employees)
        .bind(&listing.reason_for_sale)
        .bind(listing.is_franchise)
        .bind(&listing.franchise_name)
        .bind(&listing.raw_data)
        .bind(seen_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(if inserted {
            UpsertOutcome::Inserted(id)
        } else {
            UpsertOutcome::Updated(id)
        })
    }

    async fn get_listing(
        &self,
        source_id: Uuid,
        external_id: &str,
    ) -> StoreResult<Option<ListingRecord>> {
        let row: Option<ListingRow> = sqlx::query_as(
            "SELECT * FROM listings WHERE source_id = $1 AND external_id = $2",
        )
        .bind(source_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ListingRecord::from))
    }

    async fn mark_stale(&self, source_id: Uuid, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE listings
            SET is_active = FALSE
            WHERE source_id = $1 AND last_seen_at < $2 AND is_active = TRUE
            "#,
        )
        .bind(source_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_listings(&self, source_id: Uuid, active_only: bool) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM listings WHERE source_id = $1 AND (is_active OR NOT $2)",
        )
        .bind(source_id)
        .bind(active_only)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[async_trait]
impl SourceStore for PgStore {
    async fn get_by_slug(&self, slug: &str) -> StoreResult<Option<Source>> {
        let row: Option<SourceRow> =
            sqlx::query_as(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE slug = $1"))
                .bind(slug)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Source::try_from).transpose()
    }

    async fn list_active(&self) -> StoreResult<Vec<Source>> {
        let rows: Vec<SourceRow> = sqlx::query_as(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE is_active ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Source::try_from).collect()
    }

    async fn list_sources(&self) -> StoreResult<Vec<Source>> {
        let rows: Vec<SourceRow> =
            sqlx::query_as(&format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY name"))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Source::try_from).collect()
    }

    async fn create_source(&self, source: &Source) -> StoreResult<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO sources ({SOURCE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(source.id)
        .bind(&source.name)
        .bind(&source.slug)
        .bind(&source.base_url)
        .bind(source.scraper_kind.as_str())
        .bind(source.is_active)
        .bind(&source.config)
        .bind(source.created_at)
        .bind(source.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Duplicate {
                    entity: "source",
                    key: source.slug.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_active(&self, slug: &str, active: bool) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE sources SET is_active = $2, updated_at = NOW() WHERE slug = $1")
                .bind(slug)
                .bind(active)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "source",
                key: slug.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn create_job(&self, job: &ScrapeJob) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO scrape_jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(job.id)
        .bind(job.source_id)
        .bind(job.status.as_str())
        .bind(job.full_scrape)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(counter(job.counters.found))
        .bind(counter(job.counters.new))
        .bind(counter(job.counters.updated))
        .bind(&job.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_job(&self, job: &ScrapeJob) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET status = $2,
                started_at = COALESCE(started_at, $3),
                completed_at = $4,
                listings_found = $5,
                listings_new = $6,
                listings_updated = $7,
                error_message = $8
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(counter(job.counters.found))
        .bind(counter(job.counters.new))
        .bind(counter(job.counters.updated))
        .bind(&job.error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let stored: Option<String> =
            sqlx::query_scalar("SELECT status FROM scrape_jobs WHERE id = $1")
                .bind(job.id)
                .fetch_optional(&self.pool)
                .await?;
        match stored {
            None => Err(StoreError::NotFound {
                entity: "scrape job",
                key: job.id.to_string(),
            }),
            Some(status) => Err(TransitionError {
                from: status.parse::<JobStatus>().map_err(StoreError::Corrupt)?,
                to: job.status,
            }
            .into()),
        }
    }

    async fn recent_jobs(&self, limit: usize) -> StoreResult<Vec<ScrapeJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM scrape_jobs ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ScrapeJob::try_from).collect()
    }

    async fn last_full_run(&self, source_id: Uuid) -> StoreResult<Option<DateTime<Utc>>> {
        let started: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MAX(started_at) FROM scrape_jobs
            WHERE source_id = $1 AND full_scrape AND status = 'completed'
            "#,
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(started)
    }
}

#[async_trait]
impl TriggerStore for PgStore {
    async fn admit_trigger(
        &self,
        caller: &str,
        limit: usize,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent admissions for one caller across processes.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(caller)
            .execute(&mut *tx)
            .await?;

        let (accepted, oldest): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), MIN(accepted_at) FROM trigger_log
            WHERE caller = $1 AND accepted_at > $2
            "#,
        )
        .bind(caller)
        .bind(since)
        .fetch_one(&mut *tx)
        .await?;

        if usize::try_from(accepted).unwrap_or(usize::MAX) >= limit {
            tx.rollback().await?;
            return Ok(oldest.or(Some(now)));
        }

        sqlx::query("INSERT INTO trigger_log (caller, accepted_at) VALUES ($1, $2)")
            .bind(caller)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(None)
    }

    async fn prune_triggers(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM trigger_log WHERE accepted_at <= $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
