//! deskpilotd - HTTP gateway for the deskpilot orchestrator
//!
//! Wires the Docker engine, the Ollama model service and TCP readiness
//! probes into the orchestration layer and serves it over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use deskpilot_adapters::{DockerEngine, OllamaClient, TcpProbe};
use deskpilot_core::{init_tracing, DeskConfig, METRICS};
use deskpilotd::{router, AppState};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "deskpilotd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Control and streaming gateway for a sandboxed desktop container", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: SocketAddr,

    /// Shared secret required by every API route
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(args.json, level);

    if args.api_key.trim().is_empty() {
        bail!("API key must not be empty");
    }

    let config = DeskConfig::from_env();
    let models = OllamaClient::new(&config.model_service_url)
        .with_context(|| format!("invalid model service URL {}", config.model_service_url))?;

    let state = AppState::new(
        Arc::new(DockerEngine::new()),
        Arc::new(models),
        Arc::new(TcpProbe::new(config.probe_timeout())),
        &config,
        &args.api_key,
    );
    let signal_state = state.clone();

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(
        addr = %args.bind,
        recipe_dir = %config.recipe_dir.display(),
        model_service = %config.model_service_url,
        "deskpilotd listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(signal_state))
        .await
        .context("server error")?;

    METRICS.flush();
    info!("deskpilotd stopped");
    Ok(())
}

/// Resolves on Ctrl-C after ending every stream, so the graceful drain
/// does not wait on connected observers.
async fn shutdown_signal(state: AppState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    state.begin_shutdown();
}
