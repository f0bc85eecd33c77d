//! Reconciliation of freshly scraped listings against stored state.
//!
//! [`apply`] is the single source of truth for the upsert policy. The memory
//! store calls it directly; the Postgres store expresses the same rules in one
//! `INSERT ... ON CONFLICT` statement.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{Listing, ListingRecord};

/// Default window after which an unseen listing is considered gone
pub const DEFAULT_STALE_WINDOW_HOURS: i64 = 72;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(Uuid),
    Updated(Uuid),
}

impl UpsertOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) => *id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted(_))
    }
}

/// Merge `candidate` into whatever is stored for the same key.
///
/// Every scraped field is overwritten, `last_seen_at` moves to `now` and the
/// record is reactivated. Identity and `first_seen_at` never change once set.
pub fn apply(
    existing: Option<&ListingRecord>,
    source_id: Uuid,
    candidate: &Listing,
    now: DateTime<Utc>,
) -> (ListingRecord, UpsertOutcome) {
    match existing {
        Some(stored) => {
            let record = ListingRecord {
                id: stored.id,
                source_id: stored.source_id,
                listing: candidate.clone(),
                first_seen_at: stored.first_seen_at,
                last_seen_at: now.max(stored.last_seen_at),
                is_active: true,
            };
            (record, UpsertOutcome::Updated(stored.id))
        }
        None => {
            let id = Uuid::new_v4();
            let record = ListingRecord {
                id,
                source_id,
                listing: candidate.clone(),
                first_seen_at: now,
                last_seen_at: now,
                is_active: true,
            };
            (record, UpsertOutcome::Inserted(id))
        }
    }
}

pub fn stale_cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now - window
}

/// Whether a sweep with `cutoff` deactivates `record`.
pub fn is_stale(record: &ListingRecord, source_id: Uuid, cutoff: DateTime<Utc>) -> bool {
    record.is_active && record.source_id == source_id && record.last_seen_at < cutoff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shop(price: Option<i64>) -> Listing {
        let mut listing = Listing::new("1", "Shop A");
        listing.asking_price = price;
        listing
    }

    #[test]
    fn first_observation_inserts() {
        let source = Uuid::new_v4();
        let now = Utc::now();
        let (record, outcome) = apply(None, source, &shop(Some(20_000_000)), now);
        assert!(outcome.is_new());
        assert_eq!(record.id, outcome.id());
        assert_eq!(record.first_seen_at, now);
        assert_eq!(record.last_seen_at, now);
        assert!(record.is_active);
    }

    #[test]
    fn identical_rescrape_only_advances_last_seen() {
        let source = Uuid::new_v4();
        let t0 = Utc::now();
        let t1 = t0 + Duration::minutes(5);
        let candidate = shop(Some(20_000_000));

        let (first, _) = apply(None, source, &candidate, t0);
        let (second, outcome) = apply(Some(&first), source, &candidate, t1);

        assert_eq!(outcome, UpsertOutcome::Updated(first.id));
        assert_eq!(second.last_seen_at, t1);
        assert_eq!(
            ListingRecord {
                last_seen_at: t0,
                ..second
            },
            first
        );
    }

    #[test]
    fn rescrape_overwrites_fields_and_reactivates() {
        let source = Uuid::new_v4();
        let t0 = Utc::now();
        let (mut first, _) = apply(None, source, &shop(Some(20_000_000)), t0);
        first.is_active = false;

        let (second, _) = apply(Some(&first), source, &shop(None), t0 + Duration::hours(1));
        assert_eq!(second.listing.asking_price, None);
        assert!(second.is_active);
        assert_eq!(second.first_seen_at, t0);
    }

    #[test]
    fn staleness_is_scoped_to_source() {
        let alpha = Uuid::new_v4();
        let beta = Uuid::new_v4();
        let now = Utc::now();
        let cutoff = stale_cutoff(now, Duration::hours(DEFAULT_STALE_WINDOW_HOURS));

        let (old, _) = apply(None, alpha, &shop(None), now - Duration::days(5));
        let (fresh, _) = apply(None, alpha, &shop(None), now - Duration::hours(1));
        let (other, _) = apply(None, beta, &shop(None), now - Duration::days(5));

        assert!(is_stale(&old, alpha, cutoff));
        assert!(!is_stale(&fresh, alpha, cutoff));
        assert!(!is_stale(&other, alpha, cutoff));
    }
}
