//! Error types shared across the crawl-and-merge pipeline.

use std::time::Duration;

use thiserror::Error;

use crate::models::JobStatus;

/// Problems a scraper reports on its error stream.
///
/// Most variants are per-item and the crawl keeps going. [`ScrapeError::is_fatal`]
/// marks the ones that end the run early.
#[derive(Debug, Clone, Error)]
pub enum ScrapeError {
    #[error("request to {url} failed: {message}")]
    Fetch { url: String, message: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("could not parse {url}: {message}")]
    Parse { url: String, message: String },

    #[error("entry page {url} unreachable: {message}")]
    Unreachable { url: String, message: String },

    #[error("access blocked at {url} (matched {marker:?})")]
    Blocked { url: String, marker: String },

    #[error("browser unavailable: {0}")]
    Browser(String),
}

impl ScrapeError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScrapeError::Unreachable { .. } | ScrapeError::Blocked { .. } | ScrapeError::Browser(_)
        )
    }

    /// A failure on the first page means nothing can be traversed.
    pub fn at_entry(self) -> Self {
        match self {
            ScrapeError::Fetch { url, message } => ScrapeError::Unreachable { url, message },
            ScrapeError::Status { url, status } => ScrapeError::Unreachable {
                url,
                message: format!("HTTP {status}"),
            },
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, Error)]
#[error("invalid job transition from {from} to {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("{entity} already exists: {key}")]
    Duplicate { entity: &'static str, key: String },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("source not found: {0}")]
    UnknownSource(String),

    #[error("no scraper registered for: {0}")]
    NoScraper(String),

    #[error("scrape of {slug} failed: {error}")]
    Scrape {
        slug: String,
        #[source]
        error: ScrapeError,
    },

    #[error("scrape of {0} was cancelled")]
    Cancelled(String),

    #[error("scrape of {0} exceeded its deadline")]
    DeadlineExceeded(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Whether running the same task again could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Scrape { .. } | EngineError::DeadlineExceeded(_) | EngineError::Store(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task queue is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("refresh limit reached, retry in {}s", retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
