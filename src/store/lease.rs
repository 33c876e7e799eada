//! Job leases — the ownership marker the claim protocol writes.
//!
//! A lease is `(locked_by, locked_at)`. It is stale once it is
//! [`LEASE_TIMEOUT`] old; a stale lease may be taken over by any worker.
//! Leases are never renewed while a command runs.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};

/// Age at which a lease may be reclaimed by another worker.
pub const LEASE_TIMEOUT: Duration = Duration::from_secs(300);

/// Selection rounds before `acquire` gives up after losing races.
pub const MAX_CLAIM_ROUNDS: usize = 5;

/// Leases taken at or before this instant are stale at `now`.
pub fn stale_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - TimeDelta::seconds(LEASE_TIMEOUT.as_secs() as i64)
}

/// Canonical text form for persisted timestamps.
///
/// Fixed nine-digit fraction so SQL string comparison is chronological.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}
