//! vmevent-connect - event source runtime for VMware Horizon and vSphere
//!
//! # Usage
//!
//! ```bash
//! # Run the configured connector (default)
//! vmevent-connect -c vmevent.yaml
//!
//! # Validate configuration
//! vmevent-connect -c vmevent.yaml validate
//!
//! # Print the configuration schema
//! vmevent-connect schema --format yaml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vmevent_connect::config::{ConnectConfig, ConnectorConfig};
use vmevent_connect::runner;

#[derive(Parser)]
#[command(name = "vmevent-connect")]
#[command(version, about = "Event source adapters for VMware Horizon and vSphere")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "vmevent.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured connector (default)
    Run,
    /// Validate configuration file
    Validate,
    /// Show the configuration schema
    Schema {
        /// Output format (json, yaml)
        #[arg(long, default_value = "json")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    execute(cli).await
}

async fn execute(cli: Cli) -> Result<()> {
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(load_config(&cli.config)?).await,
        Commands::Validate => validate_config(&load_config(&cli.config)?),
        Commands::Schema { format } => show_schema(&format),
    }
}

fn load_config(path: &Path) -> Result<ConnectConfig> {
    ConnectConfig::from_file(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn run(config: ConnectConfig) -> Result<()> {
    info!("Starting vmevent-connect");

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal (Ctrl+C)");
        }
        signal.cancel();
    });

    runner::run_connector(&config, cancel)
        .await
        .with_context(|| format!("Connector '{}' failed", config.name))?;

    info!("vmevent-connect stopped");
    Ok(())
}

fn validate_config(config: &ConnectConfig) -> Result<()> {
    println!("✓ Configuration valid!\n");

    println!("Connector: {} ({})", config.name, config.connector.kind());
    println!("  Endpoint: {}", config.connector.endpoint());
    println!(
        "  Poll interval: {}",
        humantime::format_duration(config.connector.poll_interval())
    );
    let backoff = config.connector.backoff();
    println!(
        "  Backoff: {} .. {}",
        humantime::format_duration(backoff.initial),
        humantime::format_duration(backoff.max)
    );

    match &config.connector {
        ConnectorConfig::Horizon(horizon) => {
            println!("  User: {}\\{}", horizon.domain, horizon.username);
            println!("  Page size: {}", horizon.page_size);
            println!("  Delivery: {:?}", horizon.delivery_policy);
        }
        ConnectorConfig::Vsphere(vsphere) => {
            println!("  User: {}", vsphere.username);
            println!("  Batch size: {}", vsphere.batch_size);
            println!(
                "  Checkpoint: max age {}, period {}",
                humantime::format_duration(vsphere.checkpoint.max_age),
                humantime::format_duration(vsphere.checkpoint.period)
            );
            println!("  Store: {:?}", vsphere.store);
            println!("  Delivery: {:?}", vsphere.delivery_policy);
        }
    }
    println!();

    println!("Sink:");
    println!("  URL: {}", config.sink.url);
    println!("  Retries: {}", config.sink.retry.max_retries);

    Ok(())
}

fn show_schema(format: &str) -> Result<()> {
    let schema = ConnectConfig::json_schema();

    match format {
        "yaml" => println!("{}", serde_yaml::to_string(&schema)?),
        "json" => println!("{}", serde_json::to_string_pretty(&schema)?),
        unknown => anyhow::bail!("Unknown schema format: '{}' (expected json or yaml)", unknown),
    }

    Ok(())
}
