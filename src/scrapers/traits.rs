use tokio_util::sync::CancellationToken;

use super::types::{ScrapeOptions, ScrapeStreams};

/// Common trait for all listing scrapers.
///
/// A static HTTP scraper and a browser-driven scraper both satisfy this, so
/// the engine never needs to know which one it is driving.
pub trait SourceScraper: Send + Sync {
    /// Stable id used for registration and lookup
    fn name(&self) -> &str;

    /// Start a run in the background and hand back its streams.
    ///
    /// The producer must stop at its next suspension point once `cancel`
    /// fires, and must close both streams when it ends.
    fn scrape(&self, cancel: CancellationToken, options: ScrapeOptions) -> ScrapeStreams;
}
