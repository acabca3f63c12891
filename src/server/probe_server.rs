//! HTTP endpoint answering liveness queries on a single configured path
//!
//! Every method on every path reaches the same handler; anything but the
//! configured path is a 404. There are no other routes.

use crate::config::ProbeConfig;
use crate::probe::{Probe, ProbeResult};
use crate::server::shutdown::StopSwitch;
use axum::{extract::State, http::Uri, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Clone)]
struct ServerState {
    probe: Arc<Probe>,
    path: Arc<str>,
}

/// Owns the listening socket, quiet state (through `Probe`) and the stop switch
pub struct ProbeServer {
    config: ProbeConfig,
    probe: Arc<Probe>,
    stop: StopSwitch,
}

impl ProbeServer {
    pub fn new(config: ProbeConfig, probe: Arc<Probe>) -> Self {
        Self {
            config,
            probe,
            stop: StopSwitch::new(),
        }
    }

    /// Bind `host:port` and serve until `stop()` is called
    ///
    /// A bind failure is returned immediately and never retried.
    pub async fn start(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_address()).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until `stop()` is called
    ///
    /// In-flight requests finish before this returns.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        // Log after successful bind - server is actually listening
        info!(addr = %addr, path = %self.config.path, "Probe server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(self.stop.stopped())
            .await?;

        info!(addr = %addr, "Probe server stopped");
        Ok(())
    }

    /// Stop accepting connections and let `start()` return
    pub fn stop(&self) {
        if self.stop.stop() {
            info!("Probe server stop requested");
        }
    }

    /// Enter quiet mode; the first call fixes the quiet timestamp
    pub fn quiet(&self) {
        self.probe.quiet();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Answer a request for `path`
    pub async fn handle(&self, path: &str) -> ProbeResult {
        handle_path(&self.probe, &self.config.path, path).await
    }

    fn router(&self) -> Router {
        let state = ServerState {
            probe: self.probe.clone(),
            path: Arc::from(self.config.path.as_str()),
        };

        Router::new().fallback(probe_handler).with_state(state)
    }
}

async fn probe_handler(State(state): State<ServerState>, uri: Uri) -> ProbeResult {
    handle_path(&state.probe, &state.path, uri.path()).await
}

async fn handle_path(probe: &Probe, monitored: &str, path: &str) -> ProbeResult {
    if path != monitored {
        warn!(path = %path, "Path not found");
        return ProbeResult::NOT_FOUND;
    }

    probe.respond().await
}
