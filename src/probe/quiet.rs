//! Quiet (draining) state shared between the signal path and request handlers

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

const UNSET: i64 = i64::MIN;

/// Timestamp of the first quiet signal, published once and read by every request
///
/// Stored as epoch milliseconds in a single atomic so readers never take a lock.
/// The first `set` wins; later quiet signals do not re-arm the timeout.
#[derive(Debug)]
pub struct QuietState {
    quiet_since_ms: AtomicI64,
}

impl QuietState {
    pub fn new() -> Self {
        Self {
            quiet_since_ms: AtomicI64::new(UNSET),
        }
    }

    /// Record the quiet signal. Returns `false` if quiet mode was already set.
    pub fn set(&self, now: DateTime<Utc>) -> bool {
        self.quiet_since_ms
            .compare_exchange(
                UNSET,
                now.timestamp_millis(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn quiet_since(&self) -> Option<DateTime<Utc>> {
        match self.quiet_since_ms.load(Ordering::Acquire) {
            UNSET => None,
            ms => DateTime::<Utc>::from_timestamp_millis(ms),
        }
    }

    /// Quiet mode masks liveness only while `now - quiet_since < timeout`
    pub fn is_quiet(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let since = self.quiet_since_ms.load(Ordering::Acquire);
        if since == UNSET {
            return false;
        }

        let elapsed_ms = now.timestamp_millis().saturating_sub(since);
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        elapsed_ms < timeout_ms
    }
}

impl Default for QuietState {
    fn default() -> Self {
        Self::new()
    }
}
