//! Headless Chrome pool with fingerprint evasion.
//!
//! One browser process is shared by every browser-driven scraper. Tabs are
//! handed out as [`PageLease`] guards that close the tab when dropped.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::crawl::{crawl, Page as ResultsPage, PageSource};
use super::extract::block_marker;
use super::sites::SiteProfile;
use super::traits::SourceScraper;
use super::types::{ScrapeOptions, ScrapeStreams};
use crate::error::ScrapeError;

const LAUNCH_ARGS: &[&str] = &[
    "--disable-blink-features=AutomationControlled",
    "--disable-features=IsolateOrigins,site-per-process",
    "--disable-site-isolation-trials",
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-infobars",
    "--disable-extensions",
    "--disable-popup-blocking",
    "--disable-translate",
    "--disable-background-networking",
    "--disable-sync",
    "--disable-default-apps",
    "--mute-audio",
    "--hide-scrollbars",
    "--disable-dev-shm-usage",
];

/// Scripts registered on every new document before any page script runs.
const EVASIONS: &[&str] = &[
    "Object.defineProperty(navigator, 'webdriver', { get: () => undefined });",
    r#"Object.defineProperty(navigator, 'plugins', {
        get: () => [
            { name: 'Chrome PDF Plugin' },
            { name: 'Chrome PDF Viewer' },
            { name: 'Native Client' }
        ]
    });"#,
    "Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });",
    "window.chrome = window.chrome || {}; window.chrome.runtime = window.chrome.runtime || {};",
    r#"(() => {
        const originalQuery = window.navigator.permissions.query;
        window.navigator.permissions.query = (parameters) => (
            parameters.name === 'notifications'
                ? Promise.resolve({ state: Notification.permission })
                : originalQuery(parameters)
        );
    })();"#,
];

const SCROLL_TO_BOTTOM: &str = r#"
    new Promise((resolve) => {
        let totalHeight = 0;
        const distance = 300;
        const timer = setInterval(() => {
            window.scrollBy(0, distance);
            totalHeight += distance;
            if (totalHeight >= document.body.scrollHeight - window.innerHeight) {
                clearInterval(timer);
                resolve(true);
            }
        }, 100);
    })
"#;

/// Ready-state probe: the DOM size once loading finished, -1 before that.
const SETTLE_PROBE: &str = "document.readyState === 'complete' \
    ? document.documentElement.outerHTML.length : -1";

const SETTLE_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    /// Chrome binary override; auto-detected when unset
    pub chrome_path: Option<PathBuf>,
    /// Containers usually need the sandbox off
    pub sandbox: bool,
    pub window: (u32, u32),
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
    pub navigation_retries: u32,
    pub settle_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            sandbox: true,
            window: (1920, 1080),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            platform: "Win32".to_string(),
            navigation_retries: 3,
            settle_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Shared headless browser lending configured tabs.
pub struct BrowserPool {
    browser: Browser,
    config: BrowserConfig,
    configure: Mutex<()>,
}

impl BrowserPool {
    /// Launch the shared browser process.
    pub async fn launch(config: BrowserConfig) -> Result<Arc<Self>> {
        info!("Launching headless Chrome (headless={})...", config.headless);

        let launch_config = config.clone();
        let browser = tokio::task::spawn_blocking(move || -> Result<Browser> {
            let options = LaunchOptions::default_builder()
                .headless(launch_config.headless)
                .sandbox(launch_config.sandbox)
                .window_size(Some(launch_config.window))
                .path(launch_config.chrome_path.clone())
                .idle_browser_timeout(launch_config.idle_timeout)
                .args(LAUNCH_ARGS.iter().map(OsStr::new).collect())
                .build()
                .context("Failed to build launch options")?;
            Browser::new(options).context("Failed to launch Chrome browser")
        })
        .await
        .context("Browser launch task panicked")??;

        Ok(Arc::new(Self {
            browser,
            config,
            configure: Mutex::new(()),
        }))
    }

    /// Open a tab with the spoofed fingerprint applied.
    ///
    /// Configuration is serialized across callers; the lease itself is
    /// independent once returned.
    pub async fn acquire(&self) -> Result<PageLease> {
        let _configuring = self.configure.lock().await;

        let browser = self.browser.clone();
        let config = self.config.clone();
        let tab = tokio::task::spawn_blocking(move || -> Result<Arc<Tab>> {
            let tab = browser.new_tab().context("Failed to open tab")?;
            if let Err(e) = configure_tab(&tab, &config) {
                let _ = tab.close(false);
                return Err(e);
            }
            Ok(tab)
        })
        .await
        .context("Tab setup task panicked")??;

        debug!("Leased new browser tab");
        Ok(PageLease {
            tab,
            retries: self.config.navigation_retries,
            settle_timeout: self.config.settle_timeout,
        })
    }
}

fn configure_tab(tab: &Tab, config: &BrowserConfig) -> Result<()> {
    tab.set_user_agent(
        &config.user_agent,
        Some(config.accept_language.as_str()),
        Some(config.platform.as_str()),
    )
    .context("Failed to override user agent")?;

    for script in EVASIONS {
        let method: Page::AddScriptToEvaluateOnNewDocument =
            serde_json::from_value(json!({ "source": script }))
                .context("Failed to build evasion script command")?;
        tab.call_method(method)
            .context("Failed to register evasion script")?;
    }
    Ok(())
}

/// A borrowed tab, closed on drop.
pub struct PageLease {
    tab: Arc<Tab>,
    retries: u32,
    settle_timeout: Duration,
}

impl PageLease {
    /// Navigate with linear backoff between attempts, then wait for the page
    /// to settle.
    pub async fn navigate(&self, url: &str) -> Result<()> {
        let attempts = self.retries.max(1);
        let mut last_error = anyhow!("no navigation attempted");
        for attempt in 0..attempts {
            let tab = self.tab.clone();
            let target = url.to_string();
            let navigated = tokio::task::spawn_blocking(move || -> Result<()> {
                tab.navigate_to(&target)?;
                tab.wait_until_navigated()?;
                Ok(())
            })
            .await
            .context("Navigation task panicked")?;

            match navigated {
                Ok(()) => {
                    self.wait_settled().await;
                    return Ok(());
                }
                Err(e) => {
                    warn!("Navigation to {} failed (attempt {}): {}", url, attempt + 1, e);
                    last_error = e;
                    if let Some(delay) = retry_delay(attempt, attempts) {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(last_error.context(format!("Failed to load {url}")))
    }

    /// Poll until the document is complete and its size stops changing.
    /// Gives up quietly after the settle timeout.
    async fn wait_settled(&self) {
        let deadline = Instant::now() + self.settle_timeout;
        let mut previous = None;
        while Instant::now() < deadline {
            let size = self.evaluate(SETTLE_PROBE, false).await.ok().and_then(|v| v.as_i64());
            match size {
                Some(len) if len >= 0 && previous == Some(len) => return,
                Some(len) if len >= 0 => previous = Some(len),
                _ => {}
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
        debug!("Page did not settle within {:?}", self.settle_timeout);
    }

    /// Scroll in steps to trigger lazy-loaded content.
    pub async fn scroll_to_bottom(&self) -> Result<()> {
        self.evaluate(SCROLL_TO_BOTTOM, true).await.map(|_| ())
    }

    /// Rendered HTML of the current document.
    pub async fn content(&self) -> Result<String> {
        let value = self
            .evaluate("document.documentElement.outerHTML", false)
            .await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Could not get HTML from page"))
    }

    async fn evaluate(&self, script: &'static str, await_promise: bool) -> Result<serde_json::Value> {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || -> Result<serde_json::Value> {
            let result = tab.evaluate(script, await_promise)?;
            Ok(result.value.unwrap_or(serde_json::Value::Null))
        })
        .await
        .context("Evaluate task panicked")?
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        let tab = self.tab.clone();
        let close = move || {
            if let Err(e) = tab.close(false) {
                debug!("Failed to close tab: {}", e);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(close);
            }
            Err(_) => close(),
        }
    }
}

/// Scraper for JavaScript-rendered or bot-defended sites
pub struct BrowserScraper {
    profile: &'static SiteProfile,
    pool: Arc<BrowserPool>,
}

impl BrowserScraper {
    pub fn new(profile: &'static SiteProfile, pool: Arc<BrowserPool>) -> Self {
        Self { profile, pool }
    }
}

impl SourceScraper for BrowserScraper {
    fn name(&self) -> &str {
        self.profile.slug
    }

    fn scrape(&self, cancel: CancellationToken, options: ScrapeOptions) -> ScrapeStreams {
        let (emitter, streams) = ScrapeStreams::channel(cancel);
        let profile = self.profile;
        let pool = self.pool.clone();

        tokio::spawn(async move {
            let acquired = tokio::select! {
                biased;
                _ = emitter.token().cancelled() => return,
                acquired = pool.acquire() => acquired,
            };
            let lease = match acquired {
                Ok(lease) => lease,
                Err(e) => {
                    warn!("{}: no browser page available: {:#}", profile.name, e);
                    emitter.error(ScrapeError::Browser(format!("{e:#}"))).await;
                    return;
                }
            };

            let start_url = profile.start_url();
            info!("{}: starting browser scrape from {}", profile.name, start_url);
            let mut pages = BrowserPages { profile, lease };
            let stats = crawl(&mut pages, &start_url, &options, &emitter).await;
            info!(
                "{}: browser scrape finished after {} page(s) with {} listing(s)",
                profile.name, stats.pages, stats.emitted
            );
        });

        streams
    }
}

struct BrowserPages {
    profile: &'static SiteProfile,
    lease: PageLease,
}

#[async_trait]
impl PageSource for BrowserPages {
    fn page_size(&self) -> usize {
        self.profile.page_size
    }

    async fn fetch_page(&mut self, url: &str) -> Result<ResultsPage, ScrapeError> {
        self.lease
            .navigate(url)
            .await
            .map_err(|e| ScrapeError::Fetch {
                url: url.to_string(),
                message: format!("{e:#}"),
            })?;

        if let Err(e) = self.lease.scroll_to_bottom().await {
            debug!("Scroll failed on {}: {}", url, e);
        }

        let html = self.lease.content().await.map_err(|e| ScrapeError::Parse {
            url: url.to_string(),
            message: format!("{e:#}"),
        })?;
        check_rendered(url, &html)?;

        Ok(self.profile.extract_page(url, &html))
    }

    fn page_url(&self, page_number: usize) -> Option<String> {
        self.profile.page_url(page_number)
    }
}

/// Linear backoff between navigation attempts; none after the last one.
fn retry_delay(attempt: u32, attempts: u32) -> Option<Duration> {
    (attempt + 1 < attempts).then(|| Duration::from_secs(u64::from(attempt) + 1))
}

/// A rendered page showing a bot challenge ends the crawl.
fn check_rendered(url: &str, html: &str) -> Result<(), ScrapeError> {
    match block_marker(html) {
        Some(marker) => Err(ScrapeError::Blocked {
            url: url.to_string(),
            marker: marker.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_backoff_after_the_final_attempt() {
        assert_eq!(retry_delay(0, 3), Some(Duration::from_secs(1)));
        assert_eq!(retry_delay(1, 3), Some(Duration::from_secs(2)));
        assert_eq!(retry_delay(2, 3), None);
        assert_eq!(retry_delay(0, 1), None);
    }

    #[test]
    fn challenge_page_is_fatal() {
        let url = "https://www.bizbuysell.com/businesses-for-sale/";
        let err = check_rendered(
            url,
            "<html><title>Just a moment...</title><body>Checking your browser</body></html>",
        )
        .unwrap_err();
        assert!(matches!(err, ScrapeError::Blocked { url: ref u, .. } if u == url));
        assert!(err.is_fatal());

        assert!(check_rendered(url, "<h1>Businesses for sale</h1>").is_ok());
    }

    #[test]
    fn default_fingerprint_matches_desktop_chrome() {
        let config = BrowserConfig::default();
        assert_eq!(config.window, (1920, 1080));
        assert_eq!(config.platform, "Win32");
        assert!(config.user_agent.contains("Chrome/120"));
        assert_eq!(config.navigation_retries, 3);
    }

    #[test]
    fn evasion_commands_deserialize() {
        for script in EVASIONS {
            let method: Page::AddScriptToEvaluateOnNewDocument =
                serde_json::from_value(json!({ "source": script })).unwrap();
            assert_eq!(method.source, *script);
        }
    }

    #[test]
    fn launch_args_disable_automation_flag() {
        assert!(LAUNCH_ARGS.contains(&"--disable-blink-features=AutomationControlled"));
    }
}
