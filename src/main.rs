mod config;
mod device;
mod gate;
mod http;
mod messages;
mod plotter;
mod probe;
mod settings;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;

use config::ConfigResolver;
use device::{EbbDriver, PlotterDriver};
use gate::DeviceGate;
use http::AppState;
use probe::StatusProbe;
use settings::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plotd=info,tower_http=info".into()),
        )
        .init();

    tracing::info!("Starting plotd v{}", env!("CARGO_PKG_VERSION"));

    let settings =
        Arc::new(Settings::from_env().context("Failed to load settings from environment")?);
    tracing::info!("Artwork directory: {}", settings.art_dir.display());
    tracing::info!("Upload directory: {}", settings.upload_dir.display());
    tracing::info!("Default model: {}", settings.default_model);
    for (model, path) in &settings.model_configs {
        tracing::info!("Model {} config: {}", model, path.display());
    }
    if let Some(port) = &settings.device_port {
        tracing::info!("Using device port {}", port);
    }

    let driver: Arc<dyn PlotterDriver> = Arc::new(EbbDriver::new(settings.device_port.clone()));
    let resolver = Arc::new(ConfigResolver::new(settings.model_configs.clone()));
    let probe = Arc::new(StatusProbe::new(
        driver.clone(),
        resolver.clone(),
        settings.default_model,
    ));

    let state = AppState {
        driver,
        gate: DeviceGate::new(),
        resolver,
        probe,
        settings: settings.clone(),
    };

    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(settings.bind)
        .await
        .with_context(|| format!("Failed to bind {}", settings.bind))?;
    tracing::info!("HTTP server listening on {}", settings.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(err) => tracing::error!("Unable to listen for shutdown signal: {}", err),
    }
}
