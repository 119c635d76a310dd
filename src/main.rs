//! tcp-comms: newline-delimited TCP messaging server and client.
//!
//! - Server mode accepts connections and answers each message with a greeting
//! - Client mode dials a server and exchanges lines from stdin
//! - Configuration via CLI arguments or TOML file

use std::process::ExitCode;
use std::time::Duration;
use tcp_comms::config::{Config, Mode};
use tcp_comms::{client, Server};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long shutdown waits for blocking work such as a pending stdin read.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(200);

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        mode = ?config.mode,
        host = %config.host,
        port = config.port,
        framing = ?config.framing,
        probe_interval_ms = config.probe_interval.as_millis() as u64,
        "Starting tcp-comms"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(config));
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancellationToken::new();

    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                token.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to install Ctrl-C handler"),
        }
    });

    match config.mode {
        Mode::Server => Server::new(config).run(cancel).await?,
        Mode::Client => client::run(&config, cancel).await?,
    }

    Ok(())
}
