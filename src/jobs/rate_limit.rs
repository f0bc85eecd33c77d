use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{StoreError, TriggerError};
use crate::store::Store;

/// Per-key sliding window: at most `limit` accepted calls in any `window`.
///
/// Acceptances live in the store, so separate processes sharing a database
/// share the limit.
pub struct SlidingWindowLimiter {
    store: Arc<dyn Store>,
    limit: usize,
    window: Duration,
    span: chrono::Duration,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn Store>, limit: usize, window: Duration) -> Self {
        Self {
            store,
            limit: limit.max(1),
            window,
            span: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::weeks(52)),
        }
    }

    /// One refresh per caller per hour.
    pub fn hourly(store: Arc<dyn Store>) -> Self {
        Self::new(store, 1, Duration::from_secs(60 * 60))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a call for `key` if allowed, otherwise fail with how long
    /// until the next call would be accepted.
    pub async fn check(&self, key: &str) -> Result<(), TriggerError> {
        self.check_at(key, Utc::now()).await
    }

    pub async fn check_at(&self, key: &str, now: DateTime<Utc>) -> Result<(), TriggerError> {
        let oldest = self
            .store
            .admit_trigger(key, self.limit, now - self.span, now)
            .await?;
        match oldest {
            None => Ok(()),
            Some(oldest) => {
                let retry_after = (oldest + self.span - now).to_std().unwrap_or(Duration::ZERO);
                Err(TriggerError::RateLimited { retry_after })
            }
        }
    }

    /// Drop acceptances that have left the window.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.store.prune_triggers(now - self.span).await
    }

    /// Periodically run [`cleanup`](Self::cleanup) until cancelled.
    pub fn spawn_cleanup(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => match self.cleanup(Utc::now()).await {
                        Ok(0) => {}
                        Ok(removed) => debug!("Pruned {} expired refresh record(s)", removed),
                        Err(e) => warn!("Refresh record cleanup failed: {}", e),
                    },
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, TriggerStore};
    use chrono::Duration as Span;

    fn limiter(limit: usize, window: Duration) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(Arc::new(MemoryStore::new()), limit, window)
    }

    fn retry_after(result: Result<(), TriggerError>) -> Duration {
        match result {
            Err(TriggerError::RateLimited { retry_after }) => retry_after,
            other => panic!("expected a rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_call_in_window_is_rejected() {
        let limiter = limiter(1, Duration::from_secs(3600));
        let t0 = Utc::now();

        assert!(limiter.check_at("alice", t0).await.is_ok());
        let retry = retry_after(limiter.check_at("alice", t0 + Span::seconds(600)).await);
        assert_eq!(retry, Duration::from_secs(3000));

        // Other callers are independent.
        assert!(limiter.check_at("bob", t0).await.is_ok());
        // Once the window has passed the caller is accepted again.
        assert!(limiter.check_at("alice", t0 + Span::seconds(3600)).await.is_ok());
    }

    #[tokio::test]
    async fn window_slides_rather_than_resets() {
        let limiter = limiter(2, Duration::from_secs(10));
        let t0 = Utc::now();
        assert!(limiter.check_at("k", t0).await.is_ok());
        assert!(limiter.check_at("k", t0 + Span::seconds(6)).await.is_ok());
        assert!(limiter.check_at("k", t0 + Span::seconds(9)).await.is_err());
        assert!(limiter.check_at("k", t0 + Span::seconds(10)).await.is_ok());
        assert!(limiter.check_at("k", t0 + Span::seconds(12)).await.is_err());
    }

    #[tokio::test]
    async fn limiters_sharing_a_store_share_the_limit() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let first = SlidingWindowLimiter::hourly(store.clone());
        let second = SlidingWindowLimiter::hourly(store);

        first.check("cli").await.unwrap();
        let retry = retry_after(second.check("cli").await);
        assert!(retry > Duration::from_secs(3500));
    }

    #[tokio::test]
    async fn cleanup_forgets_expired_calls() {
        let limiter = limiter(1, Duration::from_secs(10));
        let t0 = Utc::now();
        limiter.check_at("old", t0).await.unwrap();
        limiter.check_at("recent", t0 + Span::seconds(8)).await.unwrap();

        assert_eq!(limiter.cleanup(t0 + Span::seconds(12)).await.unwrap(), 1);
        assert!(limiter
            .check_at("recent", t0 + Span::seconds(12))
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn background_cleanup_runs_until_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let limiter = Arc::new(SlidingWindowLimiter::new(
            store.clone(),
            1,
            Duration::from_secs(10),
        ));
        limiter
            .check_at("old", Utc::now() - Span::seconds(60))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        limiter.clone().spawn_cleanup(Duration::from_secs(60), cancel.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        assert_eq!(store.prune_triggers(Utc::now()).await.unwrap(), 0);
    }
}
