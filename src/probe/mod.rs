//! Liveness decision engine
//!
//! Combines three independent signals into a single HTTP answer:
//! - quiet mode (the worker is draining on purpose)
//! - stuck-job detection (a job of this process has run for an hour or more)
//! - the freshness token written by the worker loop
//!
//! The first match wins, in that order. A fresh token alone is not enough:
//! the loop can keep refreshing it while one thread is wedged on a job.

mod quiet;

pub use quiet::QuietState;

use crate::clock::Clock;
use crate::registry::{LivenessStore, RegistryError, WorkRegistry};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

/// A job of this process running at least this long marks the worker unhealthy
pub const STUCK_JOB_THRESHOLD: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Environment variable {0} is not set; cannot identify this process")]
    MissingHostname(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Status code and short diagnostic body, computed fresh per request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub status: StatusCode,
    pub body: &'static str,
}

impl ProbeResult {
    pub const ALIVE: Self = Self::new(StatusCode::OK, "Alive!");
    pub const SHUTTING_DOWN: Self = Self::new(StatusCode::OK, "Server is shutting down");
    pub const NOT_FOUND: Self = Self::new(StatusCode::NOT_FOUND, "Not found");
    pub const NO_ALIVE_KEY: Self = Self::new(StatusCode::NOT_FOUND, "Can't find the alive key");
    pub const INTERNAL_ERROR: Self =
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
    pub const STUCK: Self = Self::new(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");

    const fn new(status: StatusCode, body: &'static str) -> Self {
        Self { status, body }
    }
}

impl IntoResponse for ProbeResult {
    fn into_response(self) -> Response {
        (self.status, self.body).into_response()
    }
}

/// Where this host's name comes from when matching registered processes
#[derive(Debug, Clone)]
pub enum HostnameSource {
    /// Read the named environment variable on every check
    Env(String),
    /// Fixed value, `None` behaves like an unset variable
    Fixed(Option<String>),
}

impl HostnameSource {
    pub fn resolve(&self) -> Result<String, ProbeError> {
        match self {
            HostnameSource::Env(var) => {
                std::env::var(var).map_err(|_| ProbeError::MissingHostname(var.clone()))
            }
            HostnameSource::Fixed(Some(name)) => Ok(name.clone()),
            HostnameSource::Fixed(None) => {
                Err(ProbeError::MissingHostname("<fixed>".to_string()))
            }
        }
    }
}

/// Decision engine over the two registry collaborators plus quiet state
pub struct Probe {
    liveness: Arc<dyn LivenessStore>,
    registry: Arc<dyn WorkRegistry>,
    clock: Arc<dyn Clock>,
    hostname: HostnameSource,
    quiet: QuietState,
    quiet_timeout: Duration,
}

impl Probe {
    pub fn new(
        liveness: Arc<dyn LivenessStore>,
        registry: Arc<dyn WorkRegistry>,
        clock: Arc<dyn Clock>,
        hostname: HostnameSource,
        quiet_timeout: Duration,
    ) -> Self {
        Self {
            liveness,
            registry,
            clock,
            hostname,
            quiet: QuietState::new(),
            quiet_timeout,
        }
    }

    /// Enter quiet mode. Only the first call sets the timestamp.
    pub fn quiet(&self) {
        let now = self.clock.now();
        if self.quiet.set(now) {
            info!(
                quiet_timeout_secs = self.quiet_timeout.as_secs(),
                "Entering quiet mode"
            );
        } else {
            debug!("Already in quiet mode, keeping original timestamp");
        }
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet.is_quiet(self.clock.now(), self.quiet_timeout)
    }

    /// Whether a job claimed by this process has been running for an hour or more
    ///
    /// Returns `false` when this host is not registered. Fails when the hostname
    /// cannot be resolved, since that is misconfiguration rather than a liveness state.
    pub async fn is_processing_slowly(&self) -> Result<bool, ProbeError> {
        let hostname = self.hostname.resolve()?;

        let processes = self.registry.list_processes().await?;
        let Some(current) = processes.into_iter().find(|p| p.hostname == hostname) else {
            return Ok(false);
        };

        let jobs = self.registry.list_in_flight_jobs().await?;
        for job in jobs {
            if job.process_identity != current.identity {
                continue;
            }

            // A start time in the future is never stuck
            let stuck = self
                .clock
                .elapsed_since(job.started_at)
                .is_some_and(|elapsed| elapsed >= STUCK_JOB_THRESHOLD);

            if stuck {
                info!(
                    identity = %current.identity,
                    class = %job.payload.class,
                    args = %job.payload.args,
                    started_at = %job.started_at,
                    "Job running for more than an hour"
                );
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Quiet, then stuck-job, then freshness token. First match wins.
    pub async fn evaluate(&self) -> Result<ProbeResult, ProbeError> {
        if self.is_quiet() {
            debug!("Server in quiet mode, skipping alive key lookup");
            return Ok(ProbeResult::SHUTTING_DOWN);
        }

        if self.is_processing_slowly().await? {
            debug!("Slow job processing, skipping alive key lookup");
            return Ok(ProbeResult::STUCK);
        }

        if self.liveness.is_alive().await? {
            debug!("Found alive key");
            return Ok(ProbeResult::ALIVE);
        }

        error!("Can't find the alive key");
        Ok(ProbeResult::NO_ALIVE_KEY)
    }

    /// `evaluate` behind a failure boundary: errors and panics become a 500
    pub async fn respond(&self) -> ProbeResult {
        match AssertUnwindSafe(self.evaluate()).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!(error = %e, "Internal Server Error looking for alive key");
                ProbeResult::INTERNAL_ERROR
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(error = %message, "Internal Server Error looking for alive key");
                ProbeResult::INTERNAL_ERROR
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "probe_test.rs"]
mod tests;
