//! aranet-refreshd - keeps paired Aranet4 sensors refreshed.
//!
//! Run with: `cargo run -p aranet-refreshd -- --device AA:BB:CC:DD:EE:FF`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use aranet_refresh::{BleTransport, RefreshManager, pairing_candidates};
use aranet_refreshd::{Config, DeviceConfig, EventSink, OutputFormat, default_config_path};

const DEFAULT_LOG_FILTER: &str = "aranet_refresh=info,aranet_refreshd=info";
const VERBOSE_LOG_FILTER: &str = "aranet_refresh=debug,aranet_refreshd=debug";

/// Keeps paired Aranet4 sensors refreshed over Bluetooth LE.
#[derive(Parser, Debug)]
#[command(name = "aranet-refreshd")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Device identifier to refresh (repeatable, replaces configured devices).
    #[arg(short, long = "device", global = true)]
    devices: Vec<String>,

    /// Debug logging (ignored when RUST_LOG is set).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print events as JSON lines (overrides config).
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Refresh devices until interrupted (default behavior).
    Run,

    /// List nearby sensors that can be paired.
    Scan {
        /// Scan duration in seconds.
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },

    /// Inspect or create the configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the configuration file path.
    Path,

    /// Load and validate the configuration file.
    Check,

    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match &args.command {
        Some(Command::Scan { timeout }) => scan(&args, Duration::from_secs(*timeout)).await,
        Some(Command::Config { action }) => handle_config_action(&args, action),
        Some(Command::Run) | None => run(&args).await,
    }
}

/// Logs go to stderr so stdout carries only JSON events.
fn init_logging(verbose: bool) {
    let default = if verbose {
        VERBOSE_LOG_FILTER
    } else {
        DEFAULT_LOG_FILTER
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn config_path(args: &Args) -> PathBuf {
    args.config.clone().unwrap_or_else(default_config_path)
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    if !args.devices.is_empty() {
        config.devices = args.devices.iter().map(DeviceConfig::new).collect();
    }
    if args.json {
        config.output.format = OutputFormat::Json;
    }

    config.validate()?;
    Ok(config)
}

async fn run(args: &Args) -> anyhow::Result<()> {
    let config = load_config(args)?;
    if config.devices.is_empty() {
        bail!(
            "No devices configured. Pass --device or add [[devices]] to {}",
            config_path(args).display()
        );
    }

    let transport = BleTransport::with_config(config.ble.to_connection_config())
        .await
        .context("Failed to open Bluetooth adapter")?;
    let manager = RefreshManager::new(Arc::new(transport), config.refresh.to_refresh_config())?;

    let sink = EventSink::from_config(&config);
    let sink_task = tokio::spawn(sink.run(manager.events().subscribe()));

    for device in &config.devices {
        manager.activate(&device.identifier).await;
    }
    info!(devices = manager.device_count().await, "Refreshing");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    manager.shutdown().await;
    // Dropping the last sender lets the sink drain and exit
    drop(manager);
    if let Err(e) = sink_task.await {
        warn!(error = %e, "Event output task ended abnormally");
    }
    Ok(())
}

async fn scan(args: &Args, timeout: Duration) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let transport = BleTransport::with_config(config.ble.to_connection_config())
        .await
        .context("Failed to open Bluetooth adapter")?;

    let candidates = pairing_candidates(&transport, timeout).await?;

    if config.output.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&candidates)?);
        return Ok(());
    }

    if candidates.is_empty() {
        println!("No Aranet4 sensors found");
        return Ok(());
    }
    println!("Found {} sensor(s):", candidates.len());
    for candidate in &candidates {
        println!("  {:<24} {}", candidate.display_name, candidate.identifier);
    }
    Ok(())
}

fn handle_config_action(args: &Args, action: &ConfigAction) -> anyhow::Result<()> {
    let path = config_path(args);

    match action {
        ConfigAction::Path => {
            println!("{}", path.display());
        }
        ConfigAction::Check => {
            let config = Config::load_validated(&path)?;
            println!(
                "{}: OK ({} device(s))",
                path.display(),
                config.devices.len()
            );
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            let config = Config {
                devices: args.devices.iter().map(DeviceConfig::new).collect(),
                ..Config::default()
            };
            config.save(&path)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}
