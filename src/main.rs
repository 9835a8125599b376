//! Face Embedding Service
//!
//! Single-endpoint inference service: POST an image, get back a unit-length
//! embedding of the largest detected face.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use facevec::api::rest::{create_rest_router, AppState};
use facevec::config::Config;
use facevec::engine::OnnxAnalyzer;
use facevec::service::EmbedService;

#[tokio::main]
async fn main() {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    // Startup failure is fatal: log the cause and exit nonzero without
    // ever binding the listener.
    if let Err(e) = run().await {
        error!("startup failed: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    info!("Starting Face Embedding Service v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = Config::load(Config::default_path()).unwrap_or_else(|e| {
        info!("Using default config ({})", e);
        Config::default()
    });
    config.apply_env()?;

    info!("Configuration loaded:");
    info!("  Port: {}", config.server.port);
    info!("  Model dir: {}", config.model.dir.display());
    info!("  Providers: {}", config.model.providers);
    info!("  Detection size: {}", config.model.det_size);
    info!("  Device: {}", config.model.device_id);

    // Prepare the model handle exactly once, before accepting any request.
    // The handle is immutable for the rest of the process lifetime.
    let analyzer = Arc::new(
        OnnxAnalyzer::load(&config.model).context("model preparation failed")?,
    );

    let state = Arc::new(AppState {
        service: EmbedService::new(analyzer),
        start_time: Instant::now(),
    });
    let router = create_rest_router(state, config.server.max_upload_mb);

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Face Embedding Service is ready!");
    info!("REST: http://localhost:{}/embed-largest-face", config.server.port);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Goodbye!");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received, cleaning up...");
    }
}
