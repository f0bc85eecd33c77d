use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::queue::TaskQueue;
use super::rate_limit::SlidingWindowLimiter;
use super::Task;
use crate::error::TriggerError;

/// Entry point for user-initiated refreshes.
///
/// Each caller gets a limited number of accepted refreshes per window;
/// rejected calls are told how long to wait instead of being dropped.
/// Nothing is queued for a rejected call.
pub struct TriggerGate {
    queue: Arc<dyn TaskQueue>,
    limiter: Arc<SlidingWindowLimiter>,
}

impl TriggerGate {
    pub fn new(queue: Arc<dyn TaskQueue>, limiter: Arc<SlidingWindowLimiter>) -> Self {
        Self { queue, limiter }
    }

    /// Queue an incremental refresh of one source, or a full run of all
    /// sources when `slug` is `None`.
    pub async fn request_refresh(
        &self,
        caller: &str,
        slug: Option<&str>,
    ) -> Result<Uuid, TriggerError> {
        if let Err(e) = self.limiter.check(caller).await {
            warn!("Refresh from {} rejected: {}", caller, e);
            return Err(e);
        }

        let task = match slug {
            Some(slug) => Task::ScrapeSource {
                slug: slug.to_string(),
                max_listings: 0,
                full_scrape: false,
            },
            None => Task::ScrapeAll,
        };
        let id = self.queue.enqueue(task).await?;
        info!(task_id = %id, "Refresh requested by {}", caller);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::MemoryQueue;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn limiter(window: Duration) -> Arc<SlidingWindowLimiter> {
        Arc::new(SlidingWindowLimiter::new(
            Arc::new(MemoryStore::new()),
            1,
            window,
        ))
    }

    #[tokio::test]
    async fn one_refresh_per_caller_per_window() {
        let (queue, mut rx) = MemoryQueue::new();
        let gate = TriggerGate::new(
            Arc::new(queue),
            limiter(Duration::from_secs(3600)),
        );

        gate.request_refresh("alice", Some("bizbuysell")).await.unwrap();
        let err = gate.request_refresh("alice", None).await.unwrap_err();
        match err {
            TriggerError::RateLimited { retry_after } => {
                assert!(retry_after > Duration::from_secs(3500));
            }
            other => panic!("unexpected error: {other}"),
        }
        gate.request_refresh("bob", None).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first.task,
            Task::ScrapeSource {
                slug: "bizbuysell".into(),
                max_listings: 0,
                full_scrape: false,
            }
        );
        assert_eq!(rx.recv().await.unwrap().task, Task::ScrapeAll);
    }

    #[tokio::test]
    async fn accepted_again_after_window() {
        let (queue, _rx) = MemoryQueue::new();
        let gate = TriggerGate::new(
            Arc::new(queue),
            limiter(Duration::from_millis(20)),
        );
        gate.request_refresh("alice", None).await.unwrap();
        assert!(gate.request_refresh("alice", None).await.is_err());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(gate.request_refresh("alice", None).await.is_ok());
    }

    #[tokio::test]
    async fn rejected_refresh_queues_nothing() {
        let (queue, mut rx) = MemoryQueue::new();
        let gate = TriggerGate::new(Arc::new(queue), limiter(Duration::from_secs(3600)));

        gate.request_refresh("alice", None).await.unwrap();
        assert!(gate.request_refresh("alice", Some("bizquest")).await.is_err());

        assert_eq!(rx.recv().await.unwrap().task, Task::ScrapeAll);
        assert!(rx.try_recv().is_err());
    }
}
