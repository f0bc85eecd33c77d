use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::queue::TaskQueue;
use super::Task;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// A task enqueued on a fixed interval.
#[derive(Debug, Clone)]
pub struct PeriodicJob {
    pub name: &'static str,
    pub every: Duration,
    pub task: Task,
    /// Fire immediately instead of waiting one interval
    pub run_on_start: bool,
}

/// Daily full scrape of every source, and a daily staleness sweep.
pub fn default_schedule() -> Vec<PeriodicJob> {
    vec![
        PeriodicJob {
            name: "daily-scrape-all",
            every: DAY,
            task: Task::ScrapeAll,
            run_on_start: false,
        },
        PeriodicJob {
            name: "daily-sweep-stale",
            every: DAY,
            task: Task::SweepStale { slug: None },
            run_on_start: false,
        },
    ]
}

/// Enqueue each job on its interval until cancelled.
pub async fn run_schedule(
    jobs: Vec<PeriodicJob>,
    queue: Arc<dyn TaskQueue>,
    cancel: CancellationToken,
) {
    let mut loops = JoinSet::new();
    for job in jobs {
        let queue = queue.clone();
        let cancel = cancel.clone();
        loops.spawn(async move {
            let first = if job.run_on_start {
                Instant::now()
            } else {
                Instant::now() + job.every
            };
            let mut ticker = interval_at(first, job.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Scheduled {} every {:?}", job.name, job.every);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        match queue.enqueue(job.task.clone()).await {
                            Ok(id) => info!(task_id = %id, "Enqueued periodic {}", job.name),
                            Err(e) => {
                                error!("Could not enqueue {}: {}", job.name, e);
                                return;
                            }
                        }
                    }
                }
            }
        });
    }
    while loops.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::MemoryQueue;

    #[tokio::test(start_paused = true)]
    async fn fires_after_each_interval_not_on_start() {
        let (queue, mut rx) = MemoryQueue::new();
        let cancel = CancellationToken::new();
        let job = PeriodicJob {
            name: "test",
            every: Duration::from_secs(60),
            task: Task::ScrapeAll,
            run_on_start: false,
        };
        let handle = tokio::spawn(run_schedule(vec![job], Arc::new(queue), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(rx.recv().await.unwrap().task, Task::ScrapeAll);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.recv().await.is_some());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn default_schedule_is_daily() {
        let schedule = default_schedule();
        assert_eq!(schedule.len(), 2);
        assert!(schedule.iter().all(|j| j.every == DAY && !j.run_on_start));
    }
}
