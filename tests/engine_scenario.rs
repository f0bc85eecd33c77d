//! End-to-end runs of the engine against the in-memory store with scripted
//! scrapers standing in for real sites.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use business_scout::error::{EngineError, ScrapeError};
use business_scout::models::{JobStatus, Listing, ScraperKind, Source};
use business_scout::scrapers::{ScrapeOptions, ScrapeStreams, SourceScraper};
use business_scout::store::{JobStore, ListingStore, MemoryStore};
use business_scout::{Engine, EngineConfig};

/// One scripted run: listings, then errors, then optionally idle until
/// cancelled.
#[derive(Clone, Default)]
struct Script {
    listings: Vec<Listing>,
    errors: Vec<ScrapeError>,
    hang: bool,
}

/// Plays back one script per call to `scrape`; the last one repeats.
struct ScriptedScraper {
    runs: Mutex<VecDeque<Script>>,
}

impl ScriptedScraper {
    fn new(runs: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            runs: Mutex::new(runs.into_iter().collect()),
        })
    }

    fn next_script(&self) -> Script {
        let mut runs = self.runs.lock().unwrap();
        if runs.len() > 1 {
            runs.pop_front().unwrap_or_default()
        } else {
            runs.front().cloned().unwrap_or_default()
        }
    }
}

impl SourceScraper for ScriptedScraper {
    fn name(&self) -> &str {
        "scripted"
    }

    fn scrape(&self, cancel: CancellationToken, _options: ScrapeOptions) -> ScrapeStreams {
        let script = self.next_script();
        let (emitter, streams) = ScrapeStreams::channel(cancel);
        tokio::spawn(async move {
            for listing in script.listings {
                if !emitter.listing(listing).await {
                    return;
                }
            }
            for error in script.errors {
                if !emitter.error(error).await {
                    return;
                }
            }
            if script.hang {
                emitter.pause(Duration::from_secs(3600)).await;
            }
        });
        streams
    }
}

fn priced(id: &str, title: &str, cents: i64) -> Listing {
    Listing {
        asking_price: Some(cents),
        ..Listing::new(id, title)
    }
}

fn source(slug: &str) -> Source {
    Source::new(
        slug.to_uppercase(),
        slug,
        format!("https://{slug}.example"),
        ScraperKind::Static,
    )
}

fn quick_config() -> EngineConfig {
    EngineConfig {
        min_delay: Duration::ZERO,
        ..Default::default()
    }
}

#[tokio::test]
async fn repeat_run_updates_instead_of_duplicating() {
    let alpha = source("alpha");
    let store = Arc::new(MemoryStore::with_sources([alpha.clone()]));
    let mut engine = Engine::new(store.clone(), quick_config());
    engine.register_scraper(
        "alpha",
        ScriptedScraper::new([
            Script {
                listings: vec![
                    priced("1", "Corner Bakery", 20_000_000),
                    priced("2", "HVAC Contractor", 90_000_000),
                ],
                ..Default::default()
            },
            Script {
                listings: vec![priced("1", "Corner Bakery", 21_000_000)],
                ..Default::default()
            },
        ]),
    );

    let first = engine
        .run_source(CancellationToken::new(), "alpha", 0)
        .await
        .unwrap();
    assert_eq!(first.status, JobStatus::Completed);
    assert_eq!((first.counters.found, first.counters.new), (2, 2));
    let before = store.get_listing(alpha.id, "1").await.unwrap().unwrap();

    let second = engine
        .run_source(CancellationToken::new(), "alpha", 0)
        .await
        .unwrap();
    assert_eq!(second.counters.found, 1);
    assert_eq!(second.counters.new, 0);
    assert_eq!(second.counters.updated, 1);

    let records = store.listings(alpha.id).await;
    assert_eq!(records.len(), 2);
    let after = store.get_listing(alpha.id, "1").await.unwrap().unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.first_seen_at, before.first_seen_at);
    assert!(after.last_seen_at >= before.last_seen_at);
    assert_eq!(after.listing.asking_price, Some(21_000_000));

    let jobs = store.recent_jobs(10).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
}

#[tokio::test]
async fn cancelled_before_start_persists_nothing() {
    let alpha = source("alpha");
    let store = Arc::new(MemoryStore::with_sources([alpha.clone()]));
    let mut engine = Engine::new(store.clone(), quick_config());
    engine.register_scraper(
        "alpha",
        ScriptedScraper::new([Script {
            listings: vec![Listing::new("1", "Corner Bakery")],
            ..Default::default()
        }]),
    );

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = engine.run_source(cancel, "alpha", 0).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled(_)));

    assert!(store.listings(alpha.id).await.is_empty());
    let jobs = store.recent_jobs(1).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert!(jobs[0].completed_at.is_some());
}

#[tokio::test]
async fn cancellation_mid_run_stops_merging() {
    let alpha = source("alpha");
    let store = Arc::new(MemoryStore::with_sources([alpha.clone()]));
    let mut engine = Engine::new(store.clone(), quick_config());
    engine.register_scraper(
        "alpha",
        ScriptedScraper::new([Script {
            listings: vec![Listing::new("1", "Corner Bakery")],
            hang: true,
            ..Default::default()
        }]),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        engine.run_source(cancel, "alpha", 0),
    )
    .await
    .expect("run should end promptly after cancellation")
    .unwrap_err();
    assert!(matches!(err, EngineError::Cancelled(_)));

    let job = &store.recent_jobs(1).await.unwrap()[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.counters.found, 1);
    assert_eq!(store.listings(alpha.id).await.len(), 1);
}

#[tokio::test]
async fn missing_scraper_and_unknown_slug_are_distinct() {
    let store = Arc::new(MemoryStore::with_sources([source("gamma")]));
    let engine = Engine::new(store.clone(), quick_config());

    let err = engine
        .run_source(CancellationToken::new(), "gamma", 0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoScraper(ref slug) if slug == "gamma"));

    let err = engine
        .run_source(CancellationToken::new(), "nope", 0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownSource(_)));

    assert!(store.recent_jobs(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn run_all_keeps_going_past_failures() {
    let alpha = source("alpha");
    let store = Arc::new(MemoryStore::with_sources([
        alpha.clone(),
        source("beta"),
        source("gamma"),
    ]));
    let mut engine = Engine::new(store.clone(), quick_config());
    engine.register_scraper(
        "alpha",
        ScriptedScraper::new([Script {
            listings: vec![Listing::new("1", "Corner Bakery")],
            ..Default::default()
        }]),
    );
    engine.register_scraper(
        "gamma",
        ScriptedScraper::new([Script {
            errors: vec![ScrapeError::Unreachable {
                url: "https://gamma.example".into(),
                message: "connection refused".into(),
            }],
            ..Default::default()
        }]),
    );

    let summary = engine.run_all(CancellationToken::new()).await.unwrap();
    assert_eq!(summary.completed.len(), 1);
    let failed: Vec<&str> = summary.failed.iter().map(|(s, _)| s.as_str()).collect();
    assert_eq!(failed, ["beta", "gamma"]);
    assert_eq!(store.count_listings(alpha.id, true).await.unwrap(), 1);
}
