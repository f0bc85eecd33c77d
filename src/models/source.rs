use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which scraper variant drives a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScraperKind {
    /// Plain HTTP fetch and HTML parse
    Static,
    /// Headless browser with fingerprint evasion
    Browser,
}

impl ScraperKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScraperKind::Static => "static",
            ScraperKind::Browser => "browser",
        }
    }
}

impl fmt::Display for ScraperKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScraperKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "static" => Ok(ScraperKind::Static),
            "browser" => Ok(ScraperKind::Browser),
            other => Err(format!("unknown scraper kind: {other}")),
        }
    }
}

/// A configured brokerage or aggregator site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub base_url: String,
    pub scraper_kind: ScraperKind,
    pub is_active: bool,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    pub fn new(
        name: impl Into<String>,
        slug: impl Into<String>,
        base_url: impl Into<String>,
        scraper_kind: ScraperKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            slug: slug.into(),
            base_url: base_url.into(),
            scraper_kind,
            is_active: true,
            config: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }
}
