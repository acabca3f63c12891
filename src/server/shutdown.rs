//! Shutdown and quiet signal handling for the probe
//!
//! OS signals never act directly. Tokio's signal driver only records delivery;
//! a regular task picks the event up and performs the stop or quiet transition,
//! which may take locks that are not safe inside a signal handler.

use nix::sys::signal::Signal;
use std::future::Future;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;

/// One-way stop switch for the probe server
///
/// Once flipped it stays flipped; `stopped()` futures taken before or after
/// the flip all resolve.
#[derive(Debug)]
pub struct StopSwitch {
    tx: watch::Sender<bool>,
}

impl StopSwitch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Flip the switch. Returns `false` if it was already stopped.
    pub fn stop(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `stop()` has been called; does not borrow the switch
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            // The sender lives in `self`; an error means it is gone, which also ends serving
            let _ = rx.wait_for(|stopped| *stopped).await;
        }
    }
}

impl Default for StopSwitch {
    fn default() -> Self {
        Self::new()
    }
}

/// What a delivered OS signal asks the probe to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Shutdown,
    Quiet,
}

/// The two OS signals the probe reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSignals {
    pub shutdown: Signal,
    pub quiet: Signal,
}

impl ProbeSignals {
    /// Install handlers for both signals
    ///
    /// Must be called from within a tokio runtime. Fails for signals that
    /// cannot be caught (SIGKILL, SIGSTOP, ...).
    pub fn register(&self) -> std::io::Result<SignalListener> {
        Ok(SignalListener {
            shutdown: signal(SignalKind::from_raw(self.shutdown as i32))?,
            quiet: signal(SignalKind::from_raw(self.quiet as i32))?,
            signals: *self,
        })
    }
}

/// Registered signal streams, drained by a regular task
pub struct SignalListener {
    shutdown: tokio::signal::unix::Signal,
    quiet: tokio::signal::unix::Signal,
    signals: ProbeSignals,
}

impl SignalListener {
    /// Wait for the next shutdown or quiet signal
    ///
    /// Returns `None` once the signal driver is gone.
    pub async fn next_event(&mut self) -> Option<SignalEvent> {
        tokio::select! {
            received = self.shutdown.recv() => {
                received.map(|_| {
                    info!(signal = %self.signals.shutdown, "Received shutdown signal");
                    SignalEvent::Shutdown
                })
            }
            received = self.quiet.recv() => {
                received.map(|_| {
                    info!(signal = %self.signals.quiet, "Received quiet signal");
                    SignalEvent::Quiet
                })
            }
        }
    }
}
