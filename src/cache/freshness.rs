//! Fresh-versus-stale decisions for stored entries.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use super::CacheEntry;

/// Decides whether an entry is young enough to serve without the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    ttl: TimeDelta,
    untimestamped_fresh: bool,
}

impl Freshness {
    /// Entries younger than `ttl` are fresh. Entries written without a
    /// timestamp are fresh only when `untimestamped_fresh` is set.
    pub fn new(ttl: Duration, untimestamped_fresh: bool) -> Self {
        Self {
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            untimestamped_fresh,
        }
    }

    /// Age of an entry stored at `stored_at`, as seen at `now`.
    ///
    /// A timestamp in the future (clock step backwards) counts as age zero.
    pub fn age(stored_at: DateTime<Utc>, now: DateTime<Utc>) -> TimeDelta {
        (now - stored_at).max(TimeDelta::zero())
    }

    /// Returns `true` if `entry` is fresh at `now`.
    pub fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        match entry.stored_at {
            Some(stored_at) => Self::age(stored_at, now) < self.ttl,
            None => self.untimestamped_fresh,
        }
    }
}
