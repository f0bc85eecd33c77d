//! Orchestration of scrape runs.
//!
//! The engine owns the scraper registry, drives one scraper at a time per
//! call, merges every produced listing through the store and records the run
//! as a [`ScrapeJob`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, ScrapeError, StoreError};
use crate::merge::{self, DEFAULT_STALE_WINDOW_HOURS};
use crate::models::{JobCounters, ScrapeJob, Source};
use crate::scrapers::{ScrapeOptions, ScrapeStreams, SourceScraper};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Politeness delay between page requests
    pub min_delay: Duration,
    /// Hard ceiling on a single source run
    pub run_timeout: Duration,
    /// Listings unseen for longer than this are swept inactive
    pub stale_window: chrono::Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(2),
            run_timeout: Duration::from_secs(2 * 60 * 60),
            stale_window: chrono::Duration::hours(DEFAULT_STALE_WINDOW_HOURS),
        }
    }
}

/// Arguments for one source run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRequest {
    pub max_listings: usize,
    pub full_scrape: bool,
    /// Overrides the engine's politeness delay
    pub min_delay: Option<Duration>,
}

impl RunRequest {
    pub fn full(max_listings: usize) -> Self {
        Self {
            max_listings,
            full_scrape: true,
            min_delay: None,
        }
    }

    pub fn incremental(max_listings: usize) -> Self {
        Self {
            full_scrape: false,
            ..Self::full(max_listings)
        }
    }
}

#[derive(Debug, Default)]
pub struct RunAllSummary {
    pub completed: Vec<ScrapeJob>,
    /// Slug and reason for every source whose run failed
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    /// Slug and number of listings deactivated
    pub swept: Vec<(String, u64)>,
    /// Sources without a recent completed full run
    pub skipped: Vec<String>,
}

impl SweepReport {
    pub fn deactivated(&self) -> u64 {
        self.swept.iter().map(|(_, n)| n).sum()
    }
}

/// Why a drain loop ended before both streams closed.
enum Interrupt {
    Cancelled,
    Deadline,
    Store(StoreError),
}

pub struct Engine {
    store: Arc<dyn Store>,
    scrapers: HashMap<String, Arc<dyn SourceScraper>>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        Self {
            store,
            scrapers: HashMap::new(),
            config,
        }
    }

    /// Register the scraper that serves `slug`, replacing any previous one.
    pub fn register_scraper(&mut self, slug: impl Into<String>, scraper: Arc<dyn SourceScraper>) {
        let slug = slug.into();
        debug!("Registering scraper {} for {}", scraper.name(), slug);
        self.scrapers.insert(slug, scraper);
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Full run of one source.
    pub async fn run_source(
        &self,
        cancel: CancellationToken,
        slug: &str,
        max_listings: usize,
    ) -> Result<ScrapeJob, EngineError> {
        self.run_source_with(cancel, slug, RunRequest::full(max_listings))
            .await
    }

    pub async fn run_source_with(
        &self,
        cancel: CancellationToken,
        slug: &str,
        request: RunRequest,
    ) -> Result<ScrapeJob, EngineError> {
        let source = self
            .store
            .get_by_slug(slug)
            .await?
            .ok_or_else(|| EngineError::UnknownSource(slug.to_string()))?;
        let scraper = self
            .scrapers
            .get(slug)
            .cloned()
            .ok_or_else(|| EngineError::NoScraper(slug.to_string()))?;

        let mut job = ScrapeJob::started(source.id, request.full_scrape, Utc::now());
        self.store.create_job(&job).await?;
        info!(
            slug = %slug,
            job_id = %job.id,
            full = request.full_scrape,
            "Starting scrape of {}",
            source.name
        );

        let options = ScrapeOptions {
            full_scrape: request.full_scrape,
            max_listings: request.max_listings,
            min_delay: request.min_delay.unwrap_or(self.config.min_delay),
        };
        let run_token = cancel.child_token();
        let streams = scraper.scrape(run_token.clone(), options);

        let (counters, fatal, interrupt) = self.drain(&source, streams, &run_token).await;
        // Whatever happened, the producer must not outlive the run.
        run_token.cancel();

        let now = Utc::now();
        let outcome = match (interrupt, fatal) {
            (None, None) => {
                job.complete(counters, now).map_err(StoreError::from)?;
                Ok(())
            }
            (None, Some(error)) => {
                job.fail(counters, error.to_string(), now).map_err(StoreError::from)?;
                Err(EngineError::Scrape {
                    slug: slug.to_string(),
                    error,
                })
            }
            (Some(Interrupt::Cancelled), _) => {
                job.fail(counters, "run cancelled", now).map_err(StoreError::from)?;
                Err(EngineError::Cancelled(slug.to_string()))
            }
            (Some(Interrupt::Deadline), _) => {
                let message = format!("run exceeded {:?} deadline", self.config.run_timeout);
                job.fail(counters, message, now).map_err(StoreError::from)?;
                Err(EngineError::DeadlineExceeded(slug.to_string()))
            }
            (Some(Interrupt::Store(e)), _) => {
                job.fail(counters, e.to_string(), now).map_err(StoreError::from)?;
                Err(EngineError::Store(e))
            }
        };

        if let Err(e) = self.store.finish_job(&job).await {
            error!(slug = %slug, job_id = %job.id, "Failed to record job result: {}", e);
            outcome?;
            return Err(e.into());
        }

        match &outcome {
            Ok(()) => info!(
                slug = %slug,
                found = counters.found,
                new = counters.new,
                updated = counters.updated,
                "Scrape completed"
            ),
            Err(e) => warn!(
                slug = %slug,
                found = counters.found,
                new = counters.new,
                updated = counters.updated,
                "Scrape failed: {}",
                e
            ),
        }
        outcome.map(|()| job)
    }

    /// Consume both streams until they close, merging listings as they come.
    async fn drain(
        &self,
        source: &Source,
        streams: ScrapeStreams,
        run_token: &CancellationToken,
    ) -> (JobCounters, Option<ScrapeError>, Option<Interrupt>) {
        let ScrapeStreams {
            mut listings,
            mut errors,
        } = streams;
        let mut counters = JobCounters::default();
        let mut fatal = None;
        let (mut listings_open, mut errors_open) = (true, true);

        let deadline = tokio::time::sleep(self.config.run_timeout);
        tokio::pin!(deadline);

        while listings_open || errors_open {
            tokio::select! {
                biased;
                _ = &mut deadline => {
                    return (counters, fatal, Some(Interrupt::Deadline));
                }
                _ = run_token.cancelled() => {
                    return (counters, fatal, Some(Interrupt::Cancelled));
                }
                received = errors.recv(), if errors_open => match received {
                    Some(error) if error.is_fatal() => {
                        warn!(slug = %source.slug, "Fatal scrape error: {}", error);
                        fatal.get_or_insert(error);
                    }
                    Some(error) => warn!(slug = %source.slug, "Scrape error: {}", error),
                    None => errors_open = false,
                },
                received = listings.recv(), if listings_open => match received {
                    Some(listing) => {
                        if run_token.is_cancelled() {
                            return (counters, fatal, Some(Interrupt::Cancelled));
                        }
                        if !listing.is_identifiable() {
                            debug!(slug = %source.slug, "Dropping listing without id or title");
                            continue;
                        }
                        counters.found += 1;
                        match self.store.upsert(source.id, &listing, Utc::now()).await {
                            Ok(outcome) if outcome.is_new() => counters.new += 1,
                            Ok(_) => counters.updated += 1,
                            Err(e) => {
                                error!(
                                    slug = %source.slug,
                                    external_id = %listing.external_id,
                                    "Upsert failed: {}",
                                    e
                                );
                                return (counters, fatal, Some(Interrupt::Store(e)));
                            }
                        }
                        if counters.found % 50 == 0 {
                            debug!(slug = %source.slug, "Merged {} listings so far", counters.found);
                        }
                    }
                    None => listings_open = false,
                },
            }
        }

        (counters, fatal, None)
    }

    /// Run every active source in turn. Per-source failures are logged and
    /// collected; only failing to list the sources is an error.
    pub async fn run_all(&self, cancel: CancellationToken) -> Result<RunAllSummary, EngineError> {
        let sources = self.store.list_active().await?;
        info!("Running {} active source(s)", sources.len());

        let mut summary = RunAllSummary::default();
        for source in sources {
            if cancel.is_cancelled() {
                warn!("Run-all cancelled before {}", source.slug);
                break;
            }
            match self
                .run_source_with(cancel.clone(), &source.slug, RunRequest::full(0))
                .await
            {
                Ok(job) => summary.completed.push(job),
                Err(e) => {
                    error!("Error scraping {}: {}", source.slug, e);
                    summary.failed.push((source.slug, e.to_string()));
                }
            }
        }

        info!(
            "Run-all finished: {} completed, {} failed",
            summary.completed.len(),
            summary.failed.len()
        );
        Ok(summary)
    }

    /// Deactivate listings not seen within the stale window.
    ///
    /// A source is only swept if it had a completed full run inside the
    /// window, so a source that has been failing does not lose its catalog.
    pub async fn sweep_stale(&self, slug: Option<&str>) -> Result<SweepReport, EngineError> {
        let sources = match slug {
            Some(slug) => vec![self
                .store
                .get_by_slug(slug)
                .await?
                .ok_or_else(|| EngineError::UnknownSource(slug.to_string()))?],
            None => self.store.list_active().await?,
        };

        let cutoff = merge::stale_cutoff(Utc::now(), self.config.stale_window);
        let mut report = SweepReport::default();
        for source in sources {
            let recent_full_run = self
                .store
                .last_full_run(source.id)
                .await?
                .is_some_and(|started| started >= cutoff);
            if !recent_full_run {
                info!("Skipping sweep of {}: no full run since {}", source.slug, cutoff);
                report.skipped.push(source.slug);
                continue;
            }

            let deactivated = self.store.mark_stale(source.id, cutoff).await?;
            info!("Marked {} stale listing(s) inactive for {}", deactivated, source.slug);
            report.swept.push((source.slug, deactivated));
        }
        Ok(report)
    }
}
