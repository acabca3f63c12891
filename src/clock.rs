//! Time source for quiet-mode expiry and job run times

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Wall-clock time, injected into `Probe`
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Time since `instant`, or `None` if it lies in the future
    fn elapsed_since(&self, instant: DateTime<Utc>) -> Option<Duration> {
        self.now().signed_duration_since(instant).to_std().ok()
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at an instant, moved forward only by `advance`
#[cfg(test)]
pub struct FrozenClock {
    nanos: std::sync::atomic::AtomicI64,
}

#[cfg(test)]
impl FrozenClock {
    pub fn at(instant: DateTime<Utc>) -> Self {
        Self {
            nanos: std::sync::atomic::AtomicI64::new(
                instant.timestamp_nanos_opt().unwrap_or_default(),
            ),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_nanos()).unwrap_or(i64::MAX);
        self.nanos
            .fetch_add(by, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for FrozenClock {
    fn now(&self) -> DateTime<Utc> {
        let nanos = self.nanos.load(std::sync::atomic::Ordering::SeqCst);
        DateTime::from_timestamp(
            nanos.div_euclid(1_000_000_000),
            nanos.rem_euclid(1_000_000_000) as u32,
        )
        .unwrap_or_default()
    }
}
