use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::Parser;
use keypose_processor::api::{start_api_server, AppState};
use keypose_processor::config::Config;
use keypose_processor::engine::HttpDetectionEngine;
use keypose_processor::gateway::S3Gateway;
use keypose_processor::pipeline::Orchestrator;
use keypose_processor::scheduler::Scheduler;
use keypose_processor::store::PgResultStore;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Batch pose-detection processor
#[derive(Debug, Parser)]
#[command(name = "keypose-processor", version)]
struct Cli {
    /// Capture date to process (YYYY-MM-DD), defaults to today
    #[arg(short, long, env = "PROCESSOR_TARGET_DATE")]
    date: Option<NaiveDate>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    let target_date = cli.date.unwrap_or_else(|| Local::now().date_naive());

    info!(
        service = %config.service.name,
        device_serial = %config.pipeline.device_serial,
        date = %target_date,
        "Starting Keypose Processor"
    );

    // Initialize metrics
    if config.service.metrics_enabled {
        init_metrics(config.service.metrics_port)?;
    }

    // Initialize components
    let store = Arc::new(
        PgResultStore::new(&config.database, config.pipeline.user_id.clone())
            .await
            .context("Failed to initialize result store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let gateway = Arc::new(S3Gateway::new(&config.s3).await);
    if let Err(e) = gateway.check_bucket().await {
        warn!(bucket = %gateway.bucket(), error = %e, "S3 bucket is not reachable yet");
    }

    let engine = Arc::new(
        HttpDetectionEngine::new(&config.engine)
            .context("Failed to initialize detection engine client")?,
    );

    let orchestrator = Arc::new(Orchestrator::new(
        gateway,
        engine,
        store.clone(),
        config.pipeline.clone(),
        &config.engine,
        config.s3.key_root.clone(),
    ));

    let shutdown = CancellationToken::new();

    // Spawn scheduler task
    let scheduler_handle = if config.scheduler.enabled {
        let scheduler = Scheduler::new(
            orchestrator.clone(),
            orchestrator.device_serial().to_string(),
            target_date,
            &config.scheduler,
        );
        let token = shutdown.clone();
        Some(tokio::spawn(async move { scheduler.run(token).await }))
    } else {
        None
    };

    // Spawn API server task
    let api_handle = if config.api.enabled {
        let api_state = AppState {
            orchestrator: orchestrator.clone(),
            store,
        };
        let api_config = config.api.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = start_api_server(api_state, &api_config).await {
                error!(error = %e, "API server error");
            }
        }))
    } else {
        None
    };

    info!("Keypose Processor started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down Keypose Processor");

    // Let a running batch finish before exiting
    shutdown.cancel();
    if let Some(handle) = scheduler_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Scheduler task failed");
        }
    }
    if let Some(handle) = api_handle {
        handle.abort();
    }

    info!("Keypose Processor stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_date(value: &str) -> Option<NaiveDate> {
        Cli::try_parse_from(["keypose-processor", "--date", value])
            .ok()
            .and_then(|cli| cli.date)
    }

    #[test]
    fn test_cli_parses_iso_date() {
        assert_eq!(parse_date("2025-04-17"), NaiveDate::from_ymd_opt(2025, 4, 17));
    }

    #[test]
    fn test_cli_rejects_bad_date() {
        assert_eq!(parse_date("17/04/2025"), None);
    }
}
