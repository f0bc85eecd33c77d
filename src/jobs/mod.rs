//! Background task plumbing: what can be queued, how it is delivered and
//! what triggers it.

mod queue;
mod rate_limit;
mod schedule;
mod trigger;
mod worker;

pub use queue::{Envelope, MemoryQueue, TaskQueue, TaskReceiver};
pub use rate_limit::SlidingWindowLimiter;
pub use schedule::{default_schedule, run_schedule, PeriodicJob};
pub use trigger::TriggerGate;
pub use worker::{TaskHandler, Worker, WorkerConfig};

use serde::{Deserialize, Serialize};

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    /// Scrape one source
    #[serde(rename = "scrape")]
    ScrapeSource {
        slug: String,
        #[serde(default)]
        max_listings: usize,
        #[serde(default = "default_full_scrape")]
        full_scrape: bool,
    },
    /// Full run over every active source
    ScrapeAll,
    /// Deactivate stale listings for one source, or all when unset
    SweepStale {
        #[serde(default)]
        slug: Option<String>,
    },
}

fn default_full_scrape() -> bool {
    true
}

impl Task {
    pub fn kind(&self) -> &'static str {
        match self {
            Task::ScrapeSource { .. } => "scrape",
            Task::ScrapeAll => "scrape_all",
            Task::SweepStale { .. } => "sweep_stale",
        }
    }
}
