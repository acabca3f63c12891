use std::process::ExitCode;
use tracing::{error, info, warn};
use worker_alive::config::ProbeConfig;
use worker_alive::supervisor::{self, ChildExit};

/// Exit code for the parent once the probe child has gone away
fn exit_code(exit: ChildExit) -> ExitCode {
    match exit {
        ChildExit::Exited(0) => ExitCode::SUCCESS,
        ChildExit::Exited(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        ChildExit::Signaled(_) => ExitCode::FAILURE,
    }
}

fn main() -> anyhow::Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match ProbeConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Invalid probe configuration");
            return Err(e.into());
        }
    };

    info!(
        addr = %config.bind_address(),
        path = %config.path,
        shutdown_signal = %config.shutdown_signal,
        quiet_signal = %config.quiet_signal,
        "Starting worker liveness probe"
    );

    // Fork before any runtime exists in this process
    let handle = supervisor::start(config)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let early_exit = runtime.block_on(handle.supervise())?;
    drop(runtime);

    let exit = match early_exit {
        Some(exit) => {
            warn!(
                pid = handle.pid().as_raw(),
                exit = ?exit,
                "Probe server exited before shutdown was requested"
            );
            exit
        }
        None => handle.wait()?,
    };

    info!(exit = ?exit, "Worker liveness probe shut down");
    Ok(exit_code(exit))
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
