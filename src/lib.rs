//! Liveness probe sidecar for Sidekiq-style background workers
//!
//! Runs a tiny HTTP endpoint in a forked subprocess that answers whether the
//! worker is alive, draining, or wedged on a long-running job.

pub mod clock;
pub mod config;
pub mod probe;
pub mod registry;
pub mod server;
pub mod supervisor;
