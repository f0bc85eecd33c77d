//! Business-for-sale listing scout.
//!
//! Crawls brokerage sites through interchangeable static and headless-browser
//! scrapers, merges what they find into one deduplicated catalog keyed by
//! `(source, external id)`, and keeps it fresh on a schedule.

pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod merge;
pub mod models;
pub mod scrapers;
pub mod seed;
pub mod store;

pub use engine::{Engine, EngineConfig, RunAllSummary, RunRequest, SweepReport};
pub use error::{EngineError, ScrapeError, StoreError};
