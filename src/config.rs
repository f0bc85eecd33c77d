//! Runtime settings shared by every command.
//!
//! Values come from flags, then environment (a `.env` file is loaded first by
//! the binary), then defaults.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::engine::EngineConfig;
use crate::scrapers::BrowserConfig;

#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// PostgreSQL connection string; an in-memory store is used when unset
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Chrome/Chromium binary for browser-driven sources
    #[arg(long, env = "CHROME_PATH", global = true)]
    pub chrome_path: Option<PathBuf>,

    /// Show the browser window
    #[arg(long, env = "SCOUT_HEADFUL", global = true)]
    pub headful: bool,

    /// Disable the Chrome sandbox (needed in most containers)
    #[arg(long, env = "SCOUT_NO_SANDBOX", global = true)]
    pub no_sandbox: bool,

    /// Minimum delay between page requests, in milliseconds
    #[arg(long, env = "SCOUT_REQUEST_DELAY_MS", default_value_t = 2000, global = true)]
    pub request_delay_ms: u64,

    /// Hours after which an unseen listing is marked inactive
    #[arg(long, env = "SCOUT_STALE_HOURS", default_value_t = 72, global = true)]
    pub stale_hours: i64,

    /// Upper bound on a single source run, in minutes
    #[arg(long, env = "SCOUT_RUN_TIMEOUT_MINS", default_value_t = 120, global = true)]
    pub run_timeout_mins: u64,
}

impl Settings {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            min_delay: Duration::from_millis(self.request_delay_ms),
            run_timeout: Duration::from_secs(self.run_timeout_mins.max(1) * 60),
            stale_window: chrono::Duration::hours(self.stale_hours.max(1)),
        }
    }

    pub fn browser_config(&self) -> BrowserConfig {
        BrowserConfig {
            headless: !self.headful,
            chrome_path: self.chrome_path.clone(),
            sandbox: !self.no_sandbox,
            ..Default::default()
        }
    }
}
