//! HTTP server for the liveness probe
//!
//! Serves one configured path and reacts to two OS signals:
//! - shutdown: stop serving and let the process exit
//! - quiet: keep serving, but report "shutting down" for a while

mod probe_server;
pub mod shutdown;

pub use probe_server::ProbeServer;
pub use shutdown::{ProbeSignals, SignalEvent, SignalListener, StopSwitch};

use std::sync::Arc;

/// Apply signal events to `server` until a shutdown arrives
pub async fn drive_signals(mut listener: SignalListener, server: Arc<ProbeServer>) {
    while let Some(event) = listener.next_event().await {
        match event {
            SignalEvent::Quiet => server.quiet(),
            SignalEvent::Shutdown => {
                server.stop();
                return;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "probe_server_test.rs"]
mod probe_server_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
