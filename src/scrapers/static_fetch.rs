use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::crawl::{spawn_crawl, Page, PageSource};
use super::extract::block_marker;
use super::sites::SiteProfile;
use super::traits::SourceScraper;
use super::types::{ScrapeOptions, ScrapeStreams};
use crate::error::ScrapeError;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Plain HTTP scraper for sites that render their results server-side
pub struct StaticScraper {
    profile: &'static SiteProfile,
    client: Client,
}

impl StaticScraper {
    pub fn new(profile: &'static SiteProfile) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { profile, client })
    }
}

impl SourceScraper for StaticScraper {
    fn name(&self) -> &str {
        self.profile.slug
    }

    fn scrape(&self, cancel: CancellationToken, options: ScrapeOptions) -> ScrapeStreams {
        let pages = HttpPages {
            profile: self.profile,
            client: self.client.clone(),
        };
        spawn_crawl(
            self.profile.name.to_string(),
            pages,
            self.profile.start_url(),
            options,
            cancel,
        )
    }
}

struct HttpPages {
    profile: &'static SiteProfile,
    client: Client,
}

#[async_trait]
impl PageSource for HttpPages {
    fn page_size(&self) -> usize {
        self.profile.page_size
    }

    async fn fetch_page(&mut self, url: &str) -> Result<Page, ScrapeError> {
        let fetch_error = |e: reqwest::Error| ScrapeError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(fetch_error)?;
        let status = response.status();
        let body = response.text().await.map_err(fetch_error)?;
        debug!("{} -> {} ({} bytes)", url, status, body.len());

        classify(url, status, &body)?;
        Ok(self.profile.extract_page(url, &body))
    }

    fn page_url(&self, page_number: usize) -> Option<String> {
        self.profile.page_url(page_number)
    }
}

/// Map a response to the error taxonomy before any parsing happens.
fn classify(url: &str, status: StatusCode, body: &str) -> Result<(), ScrapeError> {
    let challenge_status = matches!(
        status,
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
    );
    if challenge_status {
        if let Some(marker) = block_marker(body) {
            return Err(ScrapeError::Blocked {
                url: url.to_string(),
                marker: marker.to_string(),
            });
        }
    }
    if !status.is_success() {
        return Err(ScrapeError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    // Some challenges are served as 200 with no results in sight.
    if !body.contains("listing") {
        if let Some(marker) = block_marker(body) {
            return Err(ScrapeError::Blocked {
                url: url.to_string(),
                marker: marker.to_string(),
            });
        }
    }
    Ok(())
}
