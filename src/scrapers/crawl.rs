//! Paginated traversal shared by the static and browser scrapers.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{Emitter, ScrapeOptions, ScrapeStreams};
use crate::error::ScrapeError;
use crate::models::Listing;

/// Candidates extracted from one results page, plus the link onward.
#[derive(Debug, Default)]
pub struct Page {
    pub candidates: Vec<Listing>,
    pub next_url: Option<String>,
}

/// Something that can turn a results-page URL into a [`Page`].
#[async_trait]
pub trait PageSource: Send {
    /// Typical number of listings per results page
    fn page_size(&self) -> usize;

    async fn fetch_page(&mut self, url: &str) -> Result<Page, ScrapeError>;

    /// Direct URL for a 1-based page number, for sites with numbered
    /// pagination. Lets traversal skip past a page that failed to load.
    fn page_url(&self, _page_number: usize) -> Option<String> {
        None
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrawlStats {
    pub pages: usize,
    pub emitted: usize,
}

/// Walk result pages from `start_url`, emitting each unseen candidate.
///
/// Stops at the first of: `max_pages` attempted, a page with no new
/// candidates, the listing cap, a fatal error, no next page, or cancellation.
pub async fn crawl<P: PageSource>(
    pages: &mut P,
    start_url: &str,
    options: &ScrapeOptions,
    emitter: &Emitter,
) -> CrawlStats {
    let max_pages = options.max_pages(pages.page_size());
    let mut seen = HashSet::new();
    let mut stats = CrawlStats::default();
    let mut attempted = 0;
    let mut next = Some(start_url.to_string());

    while let Some(url) = next.take() {
        if attempted >= max_pages {
            debug!("Reached page budget of {}", max_pages);
            break;
        }
        if attempted > 0 && !emitter.pause(jittered(options.min_delay)).await {
            break;
        }
        attempted += 1;

        debug!("Fetching page {}: {}", attempted, url);
        let fetched = tokio::select! {
            biased;
            _ = emitter.token().cancelled() => break,
            fetched = pages.fetch_page(&url) => fetched,
        };

        let page = match fetched {
            Ok(page) => page,
            Err(error) => {
                let error = if attempted == 1 { error.at_entry() } else { error };
                let fatal = error.is_fatal();
                warn!("Page {} failed: {}", attempted, error);
                if !emitter.error(error).await || fatal {
                    break;
                }
                next = pages.page_url(attempted + 1);
                continue;
            }
        };
        stats.pages += 1;

        let mut fresh = 0;
        for candidate in page.candidates {
            if !seen.insert(candidate.external_id.clone()) {
                continue;
            }
            fresh += 1;
            if !emitter.listing(candidate).await {
                return stats;
            }
            stats.emitted += 1;
            if options.cap_reached(stats.emitted) {
                info!("Listing cap of {} reached", options.max_listings);
                return stats;
            }
        }

        if fresh == 0 {
            debug!("Page {} had no new listings, stopping", attempted);
            break;
        }
        next = page.next_url;
    }

    stats
}

/// Run [`crawl`] on its own task and return the streams it feeds.
pub fn spawn_crawl<P>(
    name: String,
    mut pages: P,
    start_url: String,
    options: ScrapeOptions,
    cancel: CancellationToken,
) -> ScrapeStreams
where
    P: PageSource + 'static,
{
    let (emitter, streams) = ScrapeStreams::channel(cancel);
    tokio::spawn(async move {
        info!("{}: starting scrape from {}", name, start_url);
        let stats = crawl(&mut pages, &start_url, &options, &emitter).await;
        info!(
            "{}: scrape finished after {} page(s) with {} listing(s)",
            name, stats.pages, stats.emitted
        );
    });
    streams
}

/// The politeness delay stretched by up to half again, so requests do not
/// arrive on a fixed beat.
fn jittered(delay: Duration) -> Duration {
    let spread = u64::try_from(delay.as_millis() / 2).unwrap_or(u64::MAX);
    delay + Duration::from_millis(fastrand::u64(0..=spread))
}
