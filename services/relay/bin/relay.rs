//! Main entrypoint for the Orbi relay.
//!
//! Loads configuration, starts the server, and on SIGINT/SIGTERM drains open
//! sessions before exiting. Exits non-zero if draining times out.

use anyhow::Context;
use orbi_relay::{
    config::Config,
    server::{self, ShutdownOutcome},
    state::AppState,
};
use std::process::ExitCode;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

async fn run(config: Config) -> anyhow::Result<ShutdownOutcome> {
    let grace = config.shutdown_grace;
    info!(
        bind_address = %config.bind_address,
        agent_url = %config.agent_url,
        settings_source = ?config.settings_source,
        "Configuration loaded. Starting server..."
    );

    let state = AppState::new(config);
    let listener = TcpListener::bind(state.config.bind_address)
        .await
        .context("Failed to bind listener")?;
    let server = server::start(state, listener).context("Failed to start server")?;
    info!(address = %server.local_addr(), "Relay listening");

    server::shutdown_signal().await;
    Ok(server.shutdown(grace).await)
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    match run(config).await {
        Ok(ShutdownOutcome::Completed) => {
            info!("Server has shut down.");
            ExitCode::SUCCESS
        }
        Ok(ShutdownOutcome::TimedOut) => {
            error!("Force closing due to timeout");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = ?e, "Relay failed");
            ExitCode::FAILURE
        }
    }
}
