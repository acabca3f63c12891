//! Collaborator seams for the worker's shared bookkeeping
//!
//! The probe never writes to the registry. It only asks two questions:
//! - Has the worker loop refreshed its freshness token recently? (`LivenessStore`)
//! - Which jobs are in flight, and for which process? (`WorkRegistry`)
//!
//! Production code uses `SidekiqRedis`, which reads both from Redis.
//! Tests use `MockLivenessStore` and `MockWorkRegistry`, kept in memory.

pub mod sidekiq;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

pub use sidekiq::SidekiqRedis;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Failed to decode {what}: {message}")]
    Decode { what: String, message: String },
}

/// A worker process known to the registry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProcessInfo {
    pub hostname: String,
    pub identity: String,
}

/// Class and arguments of a running job, kept for diagnostics
///
/// Both fields are optional on the wire; only the run time decides liveness.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobPayload {
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// A unit of work claimed by a worker process and not yet finished
#[derive(Debug, Clone, PartialEq)]
pub struct InFlightJob {
    pub process_identity: String,
    pub payload: JobPayload,
    pub started_at: DateTime<Utc>,
}

/// Freshness token check written by the worker's job loop
#[async_trait]
pub trait LivenessStore: Send + Sync {
    async fn is_alive(&self) -> Result<bool, RegistryError>;
}

/// Read-only view of registered processes and their in-flight jobs
#[async_trait]
pub trait WorkRegistry: Send + Sync {
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>, RegistryError>;

    async fn list_in_flight_jobs(&self) -> Result<Vec<InFlightJob>, RegistryError>;
}

/// Liveness store with a fixed answer, switchable at runtime
#[cfg(test)]
pub struct MockLivenessStore {
    alive: std::sync::atomic::AtomicBool,
    fail: bool,
}

#[cfg(test)]
impl MockLivenessStore {
    pub fn new(alive: bool) -> Self {
        Self {
            alive: std::sync::atomic::AtomicBool::new(alive),
            fail: false,
        }
    }

    /// Store whose every lookup errors
    pub fn failing() -> Self {
        Self {
            alive: std::sync::atomic::AtomicBool::new(false),
            fail: true,
        }
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl LivenessStore for MockLivenessStore {
    async fn is_alive(&self) -> Result<bool, RegistryError> {
        if self.fail {
            return Err(RegistryError::Decode {
                what: "liveness token".to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(self.alive.load(std::sync::atomic::Ordering::SeqCst))
    }
}

/// In-memory registry for tests - stores processes and jobs for lookups
#[cfg(test)]
#[derive(Default)]
pub struct MockWorkRegistry {
    processes: Vec<ProcessInfo>,
    jobs: Vec<InFlightJob>,
    panic_on_list: bool,
    job_lookups: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MockWorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_process(mut self, hostname: &str, identity: &str) -> Self {
        self.processes.push(ProcessInfo {
            hostname: hostname.to_string(),
            identity: identity.to_string(),
        });
        self
    }

    pub fn with_job(mut self, identity: &str, class: &str, started_at: DateTime<Utc>) -> Self {
        self.jobs.push(InFlightJob {
            process_identity: identity.to_string(),
            payload: JobPayload {
                class: class.to_string(),
                args: serde_json::json!([]),
            },
            started_at,
        });
        self
    }

    /// Registry whose process listing panics, to exercise the failure boundary
    pub fn panicking() -> Self {
        Self {
            panic_on_list: true,
            ..Self::default()
        }
    }

    pub fn job_lookups(&self) -> usize {
        self.job_lookups.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl WorkRegistry for MockWorkRegistry {
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>, RegistryError> {
        if self.panic_on_list {
            panic!("registry exploded");
        }
        Ok(self.processes.clone())
    }

    async fn list_in_flight_jobs(&self) -> Result<Vec<InFlightJob>, RegistryError> {
        self.job_lookups
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self.jobs.clone())
    }
}
