pub mod browser;
pub mod crawl;
pub mod extract;
pub mod sites;
pub mod static_fetch;
pub mod traits;
pub mod types;

pub use browser::{BrowserConfig, BrowserPool, BrowserScraper, PageLease};
pub use sites::SiteProfile;
pub use static_fetch::StaticScraper;
pub use traits::SourceScraper;
pub use types::{Emitter, ScrapeOptions, ScrapeStreams};
