//! modelmux - GPU-aware model supervisor and OpenAI-compatible proxy.
//!
//! Loads a YAML config describing models and GPU/RAM budgets, then serves
//! requests, starting and swapping upstream processes on demand.

use anyhow::{Context, Result};
use clap::Parser;
use modelmux::{Config, NvidiaSmiAllocator};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "modelmux")]
#[command(about = "GPU-aware model supervisor and OpenAI-compatible proxy")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration before logging init so logLevel applies.
    let mut config = Config::from_file(&args.config)
        .await
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    // Upstream child output is logged under the "upstream" target, so it
    // can be tuned with e.g. RUST_LOG=info,upstream=debug.
    let filter = if args.verbose {
        EnvFilter::new("modelmux=debug,upstream=debug,proxy=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting modelmux");
    info!(
        models = ?config.model_ids_sorted(),
        listen = %config.listen,
        "Configuration loaded"
    );

    // Metrics exporter on its own port, if enabled.
    if config.metrics_port > 0
        && let Some(handle) = modelmux::telemetry::install()
    {
        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("Failed to bind metrics to {metrics_addr}"))?;
        info!(addr = %metrics_addr, "Serving metrics");
        let metrics_app = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, metrics_app).await {
                tracing::error!(error = %e, "Metrics server error");
            }
        });
    }

    let allocator = Arc::new(NvidiaSmiAllocator::new());
    let (app, manager) = modelmux::build_app(config.clone(), allocator);

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen))?;
    info!(addr = %config.listen, "Listening for requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Take every upstream down with us.
    manager.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
