//! Func Runner - Main entry point
//!
//! Loads the configured bundle, optionally runs one operation, then waits for
//! Ctrl-C and runs end-of-life teardown.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use func_runner::config::AppConfig;
use func_runner::sdk::{Bundle, ModuleLoader};
use func_runner::{DylibLoader, FuncRunner};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,func_runner=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Func Runner");

    // Load configuration
    let config = AppConfig::from_env();
    tracing::info!("Configuration loaded: {:?}", config);

    let properties = config.load_properties()?;
    let loader: Arc<dyn ModuleLoader> = match &config.bundle_path {
        // Safety: the bundle is trusted code built against this SDK
        Some(path) => unsafe { DylibLoader::open(path) }
            .with_context(|| format!("Failed to open bundle {}", path.display()))?
            .into_loader(),
        None => {
            tracing::warn!("No bundle configured, only control operations are available");
            Arc::new(Bundle::new("empty"))
        }
    };

    let runner = FuncRunner::new();
    let report = match runner.start(properties, loader) {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load bundle");
            return Err(e.into());
        }
    };
    tracing::info!(
        operations = ?runner.operations().names(),
        services = ?report.vendors,
        "Func Runner ready"
    );

    if let Some(name) = config.invoke.clone() {
        let request = config.load_request()?;
        let worker = runner.clone();
        let op = name.clone();
        let result = tokio::task::spawn_blocking(move || worker.dispatch(&op, request)).await?;
        match result {
            Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            Err(e) => tracing::error!(operation = %name, error = %e, "Invocation failed"),
        }
    }

    tracing::info!("Press Ctrl-C to shut down");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    let report = tokio::task::spawn_blocking(move || runner.end_life()).await?;
    tracing::info!(?report, "Goodbye");

    Ok(())
}
