//! Probe configuration loaded from environment variables
//!
//! Configuration is read once at startup and never mutated afterwards. The
//! `from_vars` seam takes a plain map so tests do not touch the process
//! environment.

use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 7433;
pub const DEFAULT_PATH: &str = "/";
pub const DEFAULT_QUIET_TIMEOUT_SECS: u64 = 180;
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_LIVENESS_KEY: &str = "SIDEKIQ::LIVENESS_PROBE_TIMESTAMP";
pub const DEFAULT_HOSTNAME_VAR: &str = "HOSTNAME";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("Shutdown and quiet signals must differ (both set to {0})")]
    SignalConflict(Signal),
}

/// Immutable settings for the probe server and its supervisor
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub host: String,
    pub port: u16,
    /// The only path the probe answers on; everything else is a 404
    pub path: String,
    /// How long quiet mode masks liveness checks after the quiet signal
    pub quiet_timeout: Duration,
    pub shutdown_signal: Signal,
    pub quiet_signal: Signal,
    pub redis_url: String,
    /// Prefix of the freshness key written by the worker loop
    pub liveness_key: String,
    /// Environment variable holding this host's name, read at check time
    pub hostname_var: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            quiet_timeout: Duration::from_secs(DEFAULT_QUIET_TIMEOUT_SECS),
            shutdown_signal: Signal::SIGTERM,
            quiet_signal: Signal::SIGTSTP,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            liveness_key: DEFAULT_LIVENESS_KEY.to_string(),
            hostname_var: DEFAULT_HOSTNAME_VAR.to_string(),
        }
    }
}

impl ProbeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing)
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = vars
            .get("WORKER_ALIVE_HOST")
            .cloned()
            .unwrap_or(defaults.host);

        let port = match vars.get("WORKER_ALIVE_PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|e| ConfigError::InvalidValue {
                var: "WORKER_ALIVE_PORT".to_string(),
                message: e.to_string(),
            })?,
            None => defaults.port,
        };

        let path = vars
            .get("WORKER_ALIVE_PATH")
            .cloned()
            .unwrap_or(defaults.path);
        if !path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                var: "WORKER_ALIVE_PATH".to_string(),
                message: format!("path must start with '/', got {:?}", path),
            });
        }

        let quiet_timeout = match vars.get("WORKER_ALIVE_QUIET_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(raw.parse::<u64>().map_err(|e| {
                ConfigError::InvalidValue {
                    var: "WORKER_ALIVE_QUIET_TIMEOUT_SECS".to_string(),
                    message: e.to_string(),
                }
            })?),
            None => defaults.quiet_timeout,
        };

        let shutdown_signal = match vars.get("WORKER_ALIVE_SHUTDOWN_SIGNAL") {
            Some(raw) => parse_signal("WORKER_ALIVE_SHUTDOWN_SIGNAL", raw)?,
            None => defaults.shutdown_signal,
        };
        let quiet_signal = match vars.get("WORKER_ALIVE_QUIET_SIGNAL") {
            Some(raw) => parse_signal("WORKER_ALIVE_QUIET_SIGNAL", raw)?,
            None => defaults.quiet_signal,
        };
        if shutdown_signal == quiet_signal {
            return Err(ConfigError::SignalConflict(shutdown_signal));
        }

        let redis_url = vars
            .get("WORKER_ALIVE_REDIS_URL")
            .cloned()
            .unwrap_or(defaults.redis_url);

        let liveness_key = vars
            .get("WORKER_ALIVE_LIVENESS_KEY")
            .cloned()
            .unwrap_or(defaults.liveness_key);

        let hostname_var = vars
            .get("WORKER_ALIVE_HOSTNAME_VAR")
            .cloned()
            .unwrap_or(defaults.hostname_var);

        Ok(ProbeConfig {
            host,
            port,
            path,
            quiet_timeout,
            shutdown_signal,
            quiet_signal,
            redis_url,
            liveness_key,
            hostname_var,
        })
    }

    /// `host:port` as handed to the listener
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse a signal name, accepting both `SIGTERM` and `term`
fn parse_signal(var: &str, raw: &str) -> Result<Signal, ConfigError> {
    let upper = raw.trim().to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };

    Signal::from_str(&name).map_err(|e| ConfigError::InvalidValue {
        var: var.to_string(),
        message: format!("unknown signal {:?}: {}", raw, e),
    })
}
