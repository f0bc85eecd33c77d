mod job;
mod listing;
mod source;

pub use job::{JobCounters, JobStatus, ScrapeJob};
pub use listing::{GeoPoint, Listing, ListingRecord, Location};
pub use source::{ScraperKind, Source};
