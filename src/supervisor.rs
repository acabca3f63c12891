//! Runs the probe server in its own OS process
//!
//! The parent and the probe child share nothing after `fork`. The parent only
//! keeps the child's pid and talks to it through signals:
//! - shutdown signal: the child stops serving and exits 0
//! - quiet signal: the child keeps serving but reports "shutting down"
//!
//! `start` must run before the parent creates any tokio runtime or installs
//! signal handlers. The child builds its own runtime from scratch.

use crate::clock::SystemClock;
use crate::config::ProbeConfig;
use crate::probe::{HostnameSource, Probe};
use crate::registry::{RegistryError, SidekiqRedis};
use crate::server::{drive_signals, ProbeServer, ProbeSignals, SignalEvent};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to fork probe server: {0}")]
    Fork(Errno),

    #[error("Failed to signal probe server (pid {pid}): {source}")]
    Signal { pid: i32, source: Errno },

    #[error("Failed to wait for probe server (pid {pid}): {source}")]
    Wait { pid: i32, source: Errno },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// How the probe child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(Signal),
}

/// Parent-side view of the probe child
#[derive(Debug, Clone, Copy)]
pub struct SupervisorHandle {
    pid: Pid,
    signals: ProbeSignals,
}

/// Fork the probe server
///
/// Returns in the parent only. The child serves until its shutdown signal
/// and then exits; a bind or setup failure exits the child with status 1.
pub fn start(config: ProbeConfig) -> Result<SupervisorHandle, SupervisorError> {
    info!(
        addr = %config.bind_address(),
        path = %config.path,
        "Starting probe server"
    );

    let signals = ProbeSignals {
        shutdown: config.shutdown_signal,
        quiet: config.quiet_signal,
    };

    // SAFETY: callers fork before spawning threads; the child builds its own runtime
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            info!(pid = child.as_raw(), "Probe server started in subprocess");
            Ok(SupervisorHandle { pid: child, signals })
        }
        Ok(ForkResult::Child) => {
            let code = match run_child(config) {
                Ok(()) => 0,
                Err(e) => {
                    error!(error = %e, "Probe server failed");
                    1
                }
            };
            std::process::exit(code);
        }
        Err(errno) => Err(SupervisorError::Fork(errno)),
    }
}

fn run_child(config: ProbeConfig) -> Result<(), SupervisorError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve_probe(config))
}

/// Wire the Redis collaborators, probe, server and signal handlers, then serve
///
/// Runs inside the child, but works in any process with a tokio runtime.
pub async fn serve_probe(config: ProbeConfig) -> Result<(), SupervisorError> {
    let hostname = std::env::var(&config.hostname_var).ok();
    let sidekiq = Arc::new(SidekiqRedis::new(
        &config.redis_url,
        &config.liveness_key,
        hostname.as_deref(),
    )?);

    let probe = Arc::new(Probe::new(
        sidekiq.clone(),
        sidekiq,
        Arc::new(SystemClock),
        HostnameSource::Env(config.hostname_var.clone()),
        config.quiet_timeout,
    ));

    // Handlers go in before bind so no signal is lost once the port is open
    let listener = ProbeSignals {
        shutdown: config.shutdown_signal,
        quiet: config.quiet_signal,
    }
    .register()?;

    let server = Arc::new(ProbeServer::new(config, probe));
    let driver = tokio::spawn(drive_signals(listener, server.clone()));

    let result = server.start().await;
    driver.abort();
    result?;

    info!("Probe server exiting");
    Ok(())
}

impl SupervisorHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Ask the child to stop serving and exit
    pub fn stop(&self) -> Result<(), SupervisorError> {
        self.send(self.signals.shutdown)?;
        info!(pid = self.pid.as_raw(), "Requested probe server stop");
        Ok(())
    }

    /// Ask the child to enter quiet mode
    pub fn quiet(&self) -> Result<(), SupervisorError> {
        self.send(self.signals.quiet)?;
        info!(pid = self.pid.as_raw(), "Requested probe server quiet mode");
        Ok(())
    }

    /// Block until the child exits
    pub fn wait(&self) -> Result<ChildExit, SupervisorError> {
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    if let Some(exit) = child_exit(status) {
                        info!(pid = self.pid.as_raw(), exit = ?exit, "Probe server stopped");
                        return Ok(exit);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(SupervisorError::Wait {
                        pid: self.pid.as_raw(),
                        source,
                    })
                }
            }
        }
    }

    /// Reap the child if it has already exited, without blocking
    pub fn try_wait(&self) -> Result<Option<ChildExit>, SupervisorError> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => Ok(child_exit(status)),
            Err(source) => Err(SupervisorError::Wait {
                pid: self.pid.as_raw(),
                source,
            }),
        }
    }

    /// Forward the configured signals received by this process to the child
    ///
    /// Returns after a shutdown signal has been forwarded. Needs a tokio runtime.
    pub async fn relay_signals(&self) -> Result<(), SupervisorError> {
        let mut listener = self.signals.register()?;

        while let Some(event) = listener.next_event().await {
            match event {
                SignalEvent::Quiet => self.quiet()?,
                SignalEvent::Shutdown => {
                    self.stop()?;
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Relay signals until shutdown has been forwarded or the child terminates
    ///
    /// Returns the child's exit status if it went away on its own, `None` once
    /// shutdown was forwarded (the caller then `wait`s). SIGCHLD also arrives
    /// when the child is stopped or continued; those keep the relay running.
    pub async fn supervise(&self) -> Result<Option<ChildExit>, SupervisorError> {
        let mut child_changed = signal(SignalKind::child())?;
        // The child may have failed before SIGCHLD was being watched
        if let Some(exit) = self.try_wait()? {
            return Ok(Some(exit));
        }

        let relay = self.relay_signals();
        tokio::pin!(relay);

        loop {
            tokio::select! {
                result = &mut relay => {
                    result?;
                    return Ok(None);
                }
                received = child_changed.recv() => {
                    if let Some(exit) = self.try_wait()? {
                        return Ok(Some(exit));
                    }
                    if received.is_none() {
                        // SIGCHLD stream is gone; only the relay can finish now
                        (&mut relay).await?;
                        return Ok(None);
                    }
                    debug!(
                        pid = self.pid.as_raw(),
                        "Probe server changed state without exiting"
                    );
                }
            }
        }
    }

    fn send(&self, signal: Signal) -> Result<(), SupervisorError> {
        kill(self.pid, signal).map_err(|source| SupervisorError::Signal {
            pid: self.pid.as_raw(),
            source,
        })
    }
}

/// Terminal wait statuses only; stops and continues are not an exit
fn child_exit(status: WaitStatus) -> Option<ChildExit> {
    match status {
        WaitStatus::Exited(_, code) => Some(ChildExit::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(ChildExit::Signaled(signal)),
        _ => None,
    }
}
