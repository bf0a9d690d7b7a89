//! Conclave server entry point
//!
//! Loads the configuration catalog, brings up MCP servers and the memory
//! adapter, and serves the REST + SSE surface until ctrl-c.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use conclave::api::api_router;
use conclave::{AppState, Config};

#[derive(Parser)]
#[command(name = "conclave")]
#[command(about = "Multi-model deliberation orchestrator")]
struct Args {
    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// HTTP port
    #[arg(long, default_value = "8001")]
    port: u16,

    /// Path to the configuration catalog
    #[arg(long, env = "CONCLAVE_CONFIG", default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Fall back to ~/.conclave/config.json when the local catalog is absent.
    let config_path = if args.config.exists() {
        args.config.clone()
    } else {
        dirs::home_dir()
            .map(|home| home.join(".conclave").join("config.json"))
            .filter(|p| p.exists())
            .unwrap_or(args.config)
    };

    let config = Config::load(&config_path)?;
    info!(
        council = config.models.council.len(),
        chairman = config.chairman_model(),
        mcp_servers = config.mcp.servers.len(),
        "configuration loaded"
    );

    let state = AppState::initialize(config).await?;

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr, "council service listening");

    let app = api_router(state.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    state.shutdown().await;
    info!("services cleaned up");
    Ok(())
}
