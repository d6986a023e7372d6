//! vutf-server - ViolentUTF execution core server
//!
//! REST API over the orchestrator service. Identity arrives from the API
//! gateway in `x-user-id`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vutf_core::target::GatewayTarget;
use vutf_core::OrchestratorService;

mod config;
mod middleware;
mod routes;
mod services;
mod state;

use services::Sweeper;
use state::AppState;

/// ViolentUTF orchestrator execution server
#[derive(Parser, Debug)]
#[command(name = "vutf-server", version, about)]
struct Cli {
    /// Path to config.toml (default: ~/.violentutf/config.toml)
    #[arg(long, env = "VUTF_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides config and VUTF_LISTEN_ADDR
    #[arg(long)]
    listen: Option<String>,
}

fn init_tracing() -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("vutf_server=info,vutf_core=info"),
    };

    let json = std::env::var("VUTF_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).try_init()?;
    } else {
        registry.with(fmt::layer()).try_init()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    info!("vutf-server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = config::Config::load(cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    match &config.config_path {
        Some(path) => info!("Config loaded from {:?}", path),
        None => info!("No config file found, using defaults"),
    }

    let target = GatewayTarget::new(&config.core.gateway)?;
    let service = Arc::new(OrchestratorService::new(config.core.clone(), Arc::new(target))?);

    let sweeper = Sweeper::start(Arc::clone(&service), config.core.pool.sweep_interval());

    let listen_addr = config.server.listen_addr.clone();
    let state = AppState::new(config, Arc::clone(&service));
    let app = routes::create_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(addr = %listen_addr, "Server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    sweeper.stop();
    service.shutdown().await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
    }
}
