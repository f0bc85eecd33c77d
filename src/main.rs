use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use business_scout::config::Settings;
use business_scout::jobs::{
    default_schedule, run_schedule, MemoryQueue, SlidingWindowLimiter, TaskQueue, TriggerGate,
    Worker, WorkerConfig,
};
use business_scout::models::ScraperKind;
use business_scout::scrapers::{sites, BrowserPool, BrowserScraper, StaticScraper};
use business_scout::seed;
use business_scout::store::{MemoryStore, PgStore, Store};
use business_scout::{Engine, RunRequest};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const TRIGGER_CLEANUP_EVERY: Duration = Duration::from_secs(60 * 60);

#[derive(Parser)]
#[command(name = "scout", about = "Crawl and merge business-for-sale listings", version)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run or inspect scrapers
    Scrape {
        #[command(subcommand)]
        command: ScrapeCommands,
    },
    /// Insert the built-in brokerage sources
    Seed,
    /// Deactivate listings not seen within the staleness window
    Sweep {
        /// Only sweep this source
        #[arg(short, long)]
        source: Option<String>,
    },
    /// Show recent scrape jobs
    Jobs {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Request an incremental refresh through the rate-limited trigger
    Refresh {
        /// Source slug; all sources when omitted
        #[arg(short, long)]
        source: Option<String>,
        /// Identity the rate limit is applied to
        #[arg(long, default_value = "cli")]
        caller: String,
    },
    /// Show catalog statistics
    Stats,
    /// Run the background worker with periodic jobs until interrupted
    Worker {
        /// Enqueue the periodic jobs immediately instead of after one interval
        #[arg(long)]
        run_now: bool,
    },
}

#[derive(Subcommand)]
enum ScrapeCommands {
    /// Scrape one source, or every active source
    Run {
        /// Source slug
        #[arg(short, long)]
        source: Option<String>,
        /// Stop after this many listings (0 = no limit)
        #[arg(short, long, default_value = "0")]
        limit: usize,
        /// Do not count this run towards the staleness sweep
        #[arg(long)]
        incremental: bool,
    },
    /// List configured sources
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "business_scout=info,scout=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let store = open_store(&cli.settings).await?;

    match cli.command {
        Commands::Scrape { command } => match command {
            ScrapeCommands::List => cmd_list(store.as_ref()).await,
            ScrapeCommands::Run {
                source,
                limit,
                incremental,
            } => {
                let engine = build_engine(&cli.settings, store).await?;
                cmd_run(&engine, source.as_deref(), limit, incremental).await
            }
        },
        Commands::Seed => {
            let created = seed::seed_sources(store.as_ref()).await?;
            info!("Seeding complete ({} new)", created);
            Ok(())
        }
        Commands::Sweep { source } => {
            let engine = Engine::new(store, cli.settings.engine_config());
            let report = engine.sweep_stale(source.as_deref()).await?;
            for (slug, count) in &report.swept {
                println!("  {}: {} deactivated", slug, count);
            }
            for slug in &report.skipped {
                println!("  {}: skipped (no recent full run)", slug);
            }
            Ok(())
        }
        Commands::Jobs { limit } => cmd_jobs(store.as_ref(), limit).await,
        Commands::Refresh { source, caller } => {
            if cli.settings.database_url.is_none() {
                warn!("Refresh limits are only kept across runs with DATABASE_URL set");
            }
            let engine = Arc::new(build_engine(&cli.settings, store).await?);
            cmd_refresh(engine, &caller, source.as_deref()).await
        }
        Commands::Stats => cmd_stats(store.as_ref()).await,
        Commands::Worker { run_now } => {
            let engine = Arc::new(build_engine(&cli.settings, store).await?);
            cmd_worker(engine, run_now).await
        }
    }
}

/// PostgreSQL when configured, otherwise an in-memory catalog holding the
/// built-in sources.
async fn open_store(settings: &Settings) -> Result<Arc<dyn Store>> {
    match &settings.database_url {
        Some(url) => {
            let store = PgStore::connect(url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set, using an in-memory store");
            Ok(Arc::new(MemoryStore::with_sources(seed::catalog())))
        }
    }
}

/// Register a scraper for every active source with a known site profile.
async fn build_engine(settings: &Settings, store: Arc<dyn Store>) -> Result<Engine> {
    let sources = store.list_active().await?;
    let mut engine = Engine::new(store, settings.engine_config());

    let needs_browser = sources.iter().any(|s| {
        s.scraper_kind == ScraperKind::Browser && sites::profile(&s.slug).is_some()
    });
    let pool = if needs_browser {
        match BrowserPool::launch(settings.browser_config()).await {
            Ok(pool) => Some(pool),
            Err(e) => {
                warn!("Browser unavailable, browser sources will be skipped: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    for source in &sources {
        let Some(profile) = sites::profile(&source.slug) else {
            warn!("No site profile for {}", source.slug);
            continue;
        };
        match source.scraper_kind {
            ScraperKind::Static => {
                let scraper = StaticScraper::new(profile)?;
                engine.register_scraper(source.slug.clone(), Arc::new(scraper));
            }
            ScraperKind::Browser => {
                if let Some(pool) = &pool {
                    let scraper = BrowserScraper::new(profile, pool.clone());
                    engine.register_scraper(source.slug.clone(), Arc::new(scraper));
                }
            }
        }
    }
    Ok(engine)
}

/// Cancelled on Ctrl-C or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        trigger.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Could not listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn cmd_list(store: &dyn Store) -> Result<()> {
    let sources = store.list_sources().await?;
    println!("Sources:");
    for source in sources {
        let status = if source.is_active { "active" } else { "inactive" };
        println!(
            "  {} ({}) - {} [{}, {}]",
            source.name, source.slug, source.base_url, source.scraper_kind, status
        );
    }
    Ok(())
}

async fn cmd_run(
    engine: &Engine,
    source: Option<&str>,
    limit: usize,
    incremental: bool,
) -> Result<()> {
    let cancel = shutdown_token();
    match source {
        Some(slug) => {
            let request = if incremental {
                RunRequest::incremental(limit)
            } else {
                RunRequest::full(limit)
            };
            let job = engine.run_source_with(cancel, slug, request).await?;
            info!(
                "Scrape of {} completed: {} found, {} new, {} updated",
                slug, job.counters.found, job.counters.new, job.counters.updated
            );
        }
        None => {
            let summary = engine.run_all(cancel).await?;
            info!(
                "Scraped {} sources, {} failed",
                summary.completed.len(),
                summary.failed.len()
            );
            for (slug, reason) in &summary.failed {
                error!("  {}: {}", slug, reason);
            }
        }
    }
    Ok(())
}

async fn cmd_jobs(store: &dyn Store, limit: usize) -> Result<()> {
    let sources = store.list_sources().await?;
    for job in store.recent_jobs(limit).await? {
        let slug = sources
            .iter()
            .find(|s| s.id == job.source_id)
            .map(|s| s.slug.as_str())
            .unwrap_or("?");
        let started = job
            .started_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "  {} {:<14} {:<9} {} found={} new={} updated={}{}",
            started,
            slug,
            job.status.as_str(),
            if job.full_scrape { "full" } else { "incr" },
            job.counters.found,
            job.counters.new,
            job.counters.updated,
            job.error_message
                .as_deref()
                .map(|m| format!(" error={m}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn cmd_refresh(engine: Arc<Engine>, caller: &str, source: Option<&str>) -> Result<()> {
    let (queue, rx) = MemoryQueue::new();
    let gate = TriggerGate::new(
        Arc::new(queue.clone()) as Arc<dyn TaskQueue>,
        Arc::new(SlidingWindowLimiter::hourly(engine.store().clone())),
    );
    let task_id = gate.request_refresh(caller, source).await?;
    info!(task_id = %task_id, "Refresh queued");

    let worker = Worker::new(engine, queue, WorkerConfig::default());
    worker.run_until_idle(rx, shutdown_token()).await;
    Ok(())
}

async fn cmd_stats(store: &dyn Store) -> Result<()> {
    let sources = store.list_sources().await?;
    let mut active_listings = 0;
    let mut total_listings = 0;
    for source in &sources {
        active_listings += store.count_listings(source.id, true).await?;
        total_listings += store.count_listings(source.id, false).await?;
    }
    let active_sources = sources.iter().filter(|s| s.is_active).count();

    println!("Statistics:");
    println!("  Active listings: {}", active_listings);
    println!("  Total listings:  {}", total_listings);
    println!("  Active sources:  {}", active_sources);
    Ok(())
}

async fn cmd_worker(engine: Arc<Engine>, run_now: bool) -> Result<()> {
    let cancel = shutdown_token();
    let (queue, rx) = MemoryQueue::new();

    let mut schedule = default_schedule();
    for job in &mut schedule {
        job.run_on_start = run_now;
    }
    let scheduler = tokio::spawn(run_schedule(
        schedule,
        Arc::new(queue.clone()) as Arc<dyn TaskQueue>,
        cancel.clone(),
    ));

    Arc::new(SlidingWindowLimiter::hourly(engine.store().clone()))
        .spawn_cleanup(TRIGGER_CLEANUP_EVERY, cancel.clone());

    let worker = Worker::new(engine, queue, WorkerConfig::default());
    info!("Worker running, press Ctrl-C to stop");
    worker.run(rx, cancel.clone()).await;

    if tokio::time::timeout(SHUTDOWN_GRACE, scheduler).await.is_err() {
        warn!("Scheduler did not stop within {:?}", SHUTDOWN_GRACE);
    }
    info!("Worker shut down");
    Ok(())
}
