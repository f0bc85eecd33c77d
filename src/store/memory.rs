use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{JobStore, ListingStore, SourceStore, StoreResult, TriggerStore};
use crate::error::{StoreError, TransitionError};
use crate::merge::{self, UpsertOutcome};
use crate::models::{JobStatus, Listing, ListingRecord, ScrapeJob, Source};

#[derive(Default)]
struct Inner {
    sources: Vec<Source>,
    listings: HashMap<(Uuid, String), ListingRecord>,
    jobs: Vec<ScrapeJob>,
    triggers: HashMap<String, VecDeque<DateTime<Utc>>>,
}

/// In-process store used by tests and database-less runs.
///
/// Each operation holds one write lock for its whole read-merge-write, which
/// gives the same atomicity as the Postgres upsert.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(sources: impl IntoIterator<Item = Source>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                sources: sources.into_iter().collect(),
                ..Default::default()
            }),
        }
    }

    /// Snapshot of one source's listings, ordered by external id.
    pub async fn listings(&self, source_id: Uuid) -> Vec<ListingRecord> {
        let inner = self.inner.read().await;
        let mut records: Vec<_> = inner
            .listings
            .values()
            .filter(|r| r.source_id == source_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.external_id().cmp(b.external_id()));
        records
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn upsert(
        &self,
        source_id: Uuid,
        listing: &Listing,
        seen_at: DateTime<Utc>,
    ) -> StoreResult<UpsertOutcome> {
        let mut inner = self.inner.write().await;
        let key = (source_id, listing.external_id.clone());
        let (record, outcome) = merge::apply(inner.listings.get(&key), source_id, listing, seen_at);
        inner.listings.insert(key, record);
        Ok(outcome)
    }

    async fn get_listing(
        &self,
        source_id: Uuid,
        external_id: &str,
    ) -> StoreResult<Option<ListingRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .listings
            .get(&(source_id, external_id.to_string()))
            .cloned())
    }

    async fn mark_stale(&self, source_id: Uuid, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let mut count = 0;
        for record in inner.listings.values_mut() {
            if merge::is_stale(record, source_id, cutoff) {
                record.is_active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn count_listings(&self, source_id: Uuid, active_only: bool) -> StoreResult<u64> {
        let inner = self.inner.read().await;
        let count = inner
            .listings
            .values()
            .filter(|r| r.source_id == source_id && (r.is_active || !active_only))
            .count();
        Ok(count as u64)
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn get_by_slug(&self, slug: &str) -> StoreResult<Option<Source>> {
        let inner = self.inner.read().await;
        Ok(inner.sources.iter().find(|s| s.slug == slug).cloned())
    }

    async fn list_active(&self) -> StoreResult<Vec<Source>> {
        let inner = self.inner.read().await;
        Ok(inner.sources.iter().filter(|s| s.is_active).cloned().collect())
    }

    async fn list_sources(&self) -> StoreResult<Vec<Source>> {
        Ok(self.inner.read().await.sources.clone())
    }

    async fn create_source(&self, source: &Source) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.sources.iter().any(|s| s.slug == source.slug) {
            return Err(StoreError::Duplicate {
                entity: "source",
                key: source.slug.clone(),
            });
        }
        inner.sources.push(source.clone());
        Ok(())
    }

    async fn set_active(&self, slug: &str, active: bool) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let source = inner
            .sources
            .iter_mut()
            .find(|s| s.slug == slug)
            .ok_or_else(|| StoreError::NotFound {
                entity: "source",
                key: slug.to_string(),
            })?;
        source.is_active = active;
        source.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: &ScrapeJob) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.jobs.iter().any(|j| j.id == job.id) {
            return Err(StoreError::Duplicate {
                entity: "scrape job",
                key: job.id.to_string(),
            });
        }
        inner.jobs.push(job.clone());
        Ok(())
    }

    async fn finish_job(&self, job: &ScrapeJob) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .jobs
            .iter_mut()
            .find(|j| j.id == job.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "scrape job",
                key: job.id.to_string(),
            })?;
        if stored.status.is_terminal() {
            return Err(TransitionError {
                from: stored.status,
                to: job.status,
            }
            .into());
        }
        *stored = job.clone();
        Ok(())
    }

    async fn recent_jobs(&self, limit: usize) -> StoreResult<Vec<ScrapeJob>> {
        let inner = self.inner.read().await;
        let mut jobs = inner.jobs.clone();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn last_full_run(&self, source_id: Uuid) -> StoreResult<Option<DateTime<Utc>>> {
        let inner = self.inner.read().await;
        Ok(inner
            .jobs
            .iter()
            .filter(|j| {
                j.source_id == source_id && j.full_scrape && j.status == JobStatus::Completed
            })
            .filter_map(|j| j.started_at)
            .max())
    }
}

#[async_trait]
impl TriggerStore for MemoryStore {
    async fn admit_trigger(
        &self,
        caller: &str,
        limit: usize,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let mut inner = self.inner.write().await;
        let accepted = inner.triggers.entry(caller.to_string()).or_default();
        while accepted.front().is_some_and(|&at| at <= since) {
            accepted.pop_front();
        }
        if accepted.len() >= limit {
            return Ok(accepted.front().copied());
        }
        accepted.push_back(now);
        Ok(None)
    }

    async fn prune_triggers(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let mut removed = 0;
        inner.triggers.retain(|_, accepted| {
            let before = accepted.len();
            accepted.retain(|&at| at > cutoff);
            removed += (before - accepted.len()) as u64;
            !accepted.is_empty()
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobCounters, ScraperKind};
    use chrono::Duration;

    fn alpha() -> Source {
        Source::new("Alpha", "alpha", "https://alpha.example", ScraperKind::Static)
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_per_key() {
        let store = MemoryStore::new();
        let source_id = Uuid::new_v4();
        let listing = Listing::new("1", "Shop A");

        let first = store.upsert(source_id, &listing, Utc::now()).await.unwrap();
        let second = store.upsert(source_id, &listing, Utc::now()).await.unwrap();

        assert!(first.is_new());
        assert_eq!(second, UpsertOutcome::Updated(first.id()));
        assert_eq!(store.count_listings(source_id, false).await.unwrap(), 1);
        // Same external id under another source is a different listing.
        let other = store.upsert(Uuid::new_v4(), &listing, Utc::now()).await.unwrap();
        assert!(other.is_new());
    }

    #[tokio::test]
    async fn sweep_touches_only_old_rows_of_the_swept_source() {
        let store = MemoryStore::new();
        let (alpha, beta) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let old = now - Duration::days(5);

        store.upsert(alpha, &Listing::new("old", "Old"), old).await.unwrap();
        store.upsert(alpha, &Listing::new("new", "New"), now).await.unwrap();
        store.upsert(beta, &Listing::new("old", "Old"), old).await.unwrap();

        let swept = store.mark_stale(alpha, now - Duration::hours(72)).await.unwrap();
        assert_eq!(swept, 1);
        assert!(!store.get_listing(alpha, "old").await.unwrap().unwrap().is_active);
        assert!(store.get_listing(alpha, "new").await.unwrap().unwrap().is_active);
        assert!(store.get_listing(beta, "old").await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn duplicate_slugs_are_rejected() {
        let store = MemoryStore::new();
        store.create_source(&alpha()).await.unwrap();
        let err = store.create_source(&alpha()).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));

        store.set_active("alpha", false).await.unwrap();
        assert!(store.list_active().await.unwrap().is_empty());
        assert_eq!(store.list_sources().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn finished_jobs_are_immutable() {
        let store = MemoryStore::new();
        let mut job = ScrapeJob::started(Uuid::new_v4(), true, Utc::now());
        store.create_job(&job).await.unwrap();

        job.complete(JobCounters::default(), Utc::now()).unwrap();
        store.finish_job(&job).await.unwrap();
        assert!(store.finish_job(&job).await.is_err());

        let last = store.last_full_run(job.source_id).await.unwrap();
        assert_eq!(last, job.started_at);
    }

    #[tokio::test]
    async fn trigger_log_counts_only_the_window() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let window = Duration::hours(1);

        assert_eq!(store.admit_trigger("alice", 1, t0 - window, t0).await.unwrap(), None);
        let later = t0 + Duration::minutes(10);
        assert_eq!(
            store.admit_trigger("alice", 1, later - window, later).await.unwrap(),
            Some(t0)
        );
        let after = t0 + window;
        assert_eq!(store.admit_trigger("alice", 1, after - window, after).await.unwrap(), None);

        store.admit_trigger("bob", 1, t0 - window, t0).await.unwrap();
        assert_eq!(store.prune_triggers(t0).await.unwrap(), 1);
        assert_eq!(store.prune_triggers(after).await.unwrap(), 1);
        assert!(store.inner.read().await.triggers.is_empty());
    }
}
