use tracing::{info, warn};

use crate::error::StoreError;
use crate::models::{ScraperKind, Source};
use crate::store::SourceStore;

/// Brokerage sites known out of the box.
pub fn catalog() -> Vec<Source> {
    [
        ("BizBuySell", "bizbuysell", "https://www.bizbuysell.com", ScraperKind::Browser),
        ("BizQuest", "bizquest", "https://www.bizquest.com", ScraperKind::Static),
        ("BusinessBroker.net", "businessbroker", "https://www.businessbroker.net", ScraperKind::Static),
        ("Sunbelt Network", "sunbelt", "https://www.sunbeltnetwork.com", ScraperKind::Static),
        ("Transworld Business Advisors", "transworld", "https://www.tworld.com", ScraperKind::Static),
        ("FirstChoice Business Brokers", "firstchoice", "https://www.fcbb.com", ScraperKind::Static),
    ]
    .into_iter()
    .map(|(name, slug, base_url, kind)| Source::new(name, slug, base_url, kind))
    .collect()
}

/// Insert every catalog source that is not stored yet. Returns how many were
/// created.
pub async fn seed_sources<S>(store: &S) -> Result<usize, StoreError>
where
    S: SourceStore + ?Sized,
{
    let mut created = 0;
    for source in catalog() {
        match store.create_source(&source).await {
            Ok(()) => {
                info!("Seeded source: {}", source.name);
                created += 1;
            }
            Err(StoreError::Duplicate { .. }) => info!("Source already exists: {}", source.name),
            Err(e) => warn!("Failed to seed source {}: {}", source.name, e),
        }
    }
    Ok(created)
}
