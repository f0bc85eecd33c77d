use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ScrapeError;
use crate::models::Listing;

/// Capacity of the listing stream between a scraper and the engine
pub const LISTING_BUFFER: usize = 100;
/// Capacity of the error stream
pub const ERROR_BUFFER: usize = 10;
/// Page ceiling when a run has no listing cap
pub const UNBOUNDED_PAGE_CEILING: usize = 50;

/// Per-run scrape configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeOptions {
    /// Full runs feed the staleness sweep; incremental runs only refresh
    pub full_scrape: bool,
    /// Stop after this many listings (0 = no cap)
    pub max_listings: usize,
    /// Minimum pause between page requests
    pub min_delay: Duration,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            full_scrape: true,
            max_listings: 0,
            min_delay: Duration::from_secs(2),
        }
    }
}

impl ScrapeOptions {
    pub fn max_pages(&self, page_size: usize) -> usize {
        if self.max_listings == 0 {
            UNBOUNDED_PAGE_CEILING
        } else {
            self.max_listings / page_size.max(1) + 1
        }
    }

    pub fn cap_reached(&self, emitted: usize) -> bool {
        self.max_listings > 0 && emitted >= self.max_listings
    }
}

/// The two read-only streams a scrape run hands back. Both close when the
/// producer finishes or is cancelled.
pub struct ScrapeStreams {
    pub listings: mpsc::Receiver<Listing>,
    pub errors: mpsc::Receiver<ScrapeError>,
}

impl ScrapeStreams {
    pub fn channel(cancel: CancellationToken) -> (Emitter, ScrapeStreams) {
        let (listing_tx, listing_rx) = mpsc::channel(LISTING_BUFFER);
        let (error_tx, error_rx) = mpsc::channel(ERROR_BUFFER);
        let emitter = Emitter {
            listings: listing_tx,
            errors: error_tx,
            cancel,
        };
        let streams = ScrapeStreams {
            listings: listing_rx,
            errors: error_rx,
        };
        (emitter, streams)
    }
}

/// Producer half of [`ScrapeStreams`].
///
/// Every send races against the run's cancellation token, so a stalled
/// consumer can never pin the producer task. A full error stream applies the
/// same backpressure as a full listing stream; nothing is dropped.
#[derive(Clone)]
pub struct Emitter {
    listings: mpsc::Sender<Listing>,
    errors: mpsc::Sender<ScrapeError>,
    cancel: CancellationToken,
}

impl Emitter {
    /// Returns `false` once the run is over and the producer should stop.
    pub async fn listing(&self, listing: Listing) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.listings.send(listing) => sent.is_ok(),
        }
    }

    /// Returns `false` once the run is over and the producer should stop.
    pub async fn error(&self, error: ScrapeError) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.errors.send(error) => sent.is_ok(),
        }
    }

    /// Politeness delay. Returns `false` if the run was cancelled meanwhile.
    pub async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.is_cancelled();
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}
