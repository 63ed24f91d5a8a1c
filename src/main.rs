//! BMS Ingestor - Main Entry Point
//!
//! `run` starts the ingestion service; `config`, `report` and `device` are
//! operator commands that read configuration or storage and exit.

use bms_ingestor::config::IngestorConfig;
use bms_ingestor::error::{sanitize_error_message, IngestError};
use bms_ingestor::ingestor::{storage_report, Ingestor};
use bms_ingestor::observability::{init_default_logging, metrics};
use bms_ingestor::storage::{DeviceRegistry, Storage, SupabaseConfig, SupabaseStorage};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

/// MQTT telemetry ingestion for battery management systems
#[derive(Parser)]
#[command(name = "bms-ingestor")]
#[command(about = "MQTT telemetry ingestion service for battery management systems")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BMS_INGESTOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestor until interrupted (default)
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
    /// Summarize the device registry and the latest telemetry records
    Report {
        /// Number of telemetry records to list
        #[arg(short, long, default_value_t = 5)]
        limit: usize,
    },
    /// Show the registry entry for one device
    Device {
        /// Device serial (packsn)
        device_id: String,
    },
}

#[tokio::main]
async fn main() {
    // A missing .env is normal in production.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    init_default_logging();

    let config = match IngestorConfig::resolve(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(
                "Failed to load configuration: {}",
                sanitize_error_message(&e.to_string())
            );
            process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_ingestor(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Report { limit } => handle_report_command(&config, limit).await,
        Commands::Device { device_id } => handle_device_command(&config, &device_id).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e.sanitized_message());
        process::exit(1);
    }
}

async fn run_ingestor(config: IngestorConfig) -> Result<(), IngestError> {
    info!(
        "Starting BMS ingestor v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut ingestor = Ingestor::from_config(config)?;
    ingestor.start().await?;

    wait_for_shutdown_signal().await?;

    info!("Application shutdown initiated");
    ingestor.shutdown().await?;

    let snapshot = metrics().get_metrics();
    info!(
        received = snapshot.ingest.messages_received,
        stored = snapshot.ingest.records_stored,
        dropped = snapshot.ingest.messages_dropped,
        storage_failures = snapshot.ingest.storage_failures,
        "Application shutdown complete"
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<(), IngestError> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .map_err(|e| IngestError::initialization(format!("cannot install SIGINT handler: {e}")))?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(|e| IngestError::initialization(format!("cannot install SIGTERM handler: {e}")))?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<(), IngestError> {
    signal::ctrl_c()
        .await
        .map_err(|e| IngestError::initialization(format!("cannot install Ctrl-C handler: {e}")))?;
    info!("Received Ctrl-C, shutting down gracefully...");
    Ok(())
}

fn handle_config_command(config: &IngestorConfig, show: bool) -> Result<(), IngestError> {
    if show {
        println!("Current configuration:");
        for line in config.display_lines() {
            println!("  {line}");
        }
    }
    info!("Configuration validation complete");
    Ok(())
}

fn open_storage(config: &IngestorConfig) -> Result<Arc<dyn Storage>, IngestError> {
    let storage = SupabaseStorage::new(SupabaseConfig::from_ingestor_config(config)?)?;
    Ok(Arc::new(storage))
}

async fn handle_report_command(config: &IngestorConfig, limit: usize) -> Result<(), IngestError> {
    let report = storage_report(open_storage(config)?, limit).await?;

    println!("Registered devices: {}", report.devices.len());
    for entry in &report.devices {
        println!(
            "  {} ({})",
            entry.device_id().unwrap_or_else(|| "<no serial>".to_string()),
            entry.manufacturer.as_deref().unwrap_or("unknown manufacturer")
        );
    }

    println!("Latest telemetry records: {}", report.latest_telemetry.len());
    for row in &report.latest_telemetry {
        println!("  {row}");
    }
    Ok(())
}

async fn handle_device_command(config: &IngestorConfig, device_id: &str) -> Result<(), IngestError> {
    let registry = DeviceRegistry::new(open_storage(config)?);
    match registry.entry(device_id.trim()).await? {
        Some(entry) => {
            let rendered = serde_json::to_string_pretty(&entry)
                .map_err(|e| IngestError::internal(format!("cannot render entry: {e}")))?;
            println!("{rendered}");
        }
        None => println!("Device '{}' is not in the registry", device_id.trim()),
    }
    Ok(())
}
