//! Persistence seams consumed by the engine and the job layer.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::merge::UpsertOutcome;
use crate::models::{Listing, ListingRecord, ScrapeJob, Source};

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Atomic insert-or-update keyed on `(source_id, external_id)`.
    async fn upsert(
        &self,
        source_id: Uuid,
        listing: &Listing,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<UpsertOutcome>;

    async fn get_listing(
        &self,
        source_id: Uuid,
        external_id: &str,
    ) -> StoreResult<Option<ListingRecord>>;

    /// Deactivate this source's active listings last seen before `cutoff`.
    /// Returns how many were deactivated.
    async fn mark_stale(&self, source_id: Uuid, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    async fn count_listings(&self, source_id: Uuid, active_only: bool) -> StoreResult<u64>;
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn get_by_slug(&self, slug: &str) -> StoreResult<Option<Source>>;

    async fn list_active(&self) -> StoreResult<Vec<Source>>;

    async fn list_sources(&self) -> StoreResult<Vec<Source>>;

    /// Fails with [`StoreError::Duplicate`] if the slug is taken.
    async fn create_source(&self, source: &Source) -> StoreResult<()>;

    async fn set_active(&self, slug: &str, active: bool) -> StoreResult<()>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &ScrapeJob) -> StoreResult<()>;

    /// Persist the final state of a job. A job that is already terminal in the
    /// store is never overwritten.
    async fn finish_job(&self, job: &ScrapeJob) -> StoreResult<()>;

    async fn recent_jobs(&self, limit: usize) -> StoreResult<Vec<ScrapeJob>>;

    /// Start time of the most recent completed full run of a source.
    async fn last_full_run(&self, source_id: Uuid) -> StoreResult<Option<DateTime<Utc>>>;
}

/// Accepted on-demand refreshes, shared by every process using the store.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Record an acceptance for `caller` at `now` unless it already has
    /// `limit` acceptances after `since`. Returns `None` when recorded,
    /// otherwise the oldest acceptance still inside the window.
    async fn admit_trigger(
        &self,
        caller: &str,
        limit: usize,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>>;

    /// Forget acceptances at or before `cutoff`. Returns how many went.
    async fn prune_triggers(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

/// Everything the engine and the job layer need from persistence.
pub trait Store: ListingStore + SourceStore + JobStore + TriggerStore {}

impl<T: ListingStore + SourceStore + JobStore + TriggerStore> Store for T {}
