//! m2mp - device connectivity backend
//!
//! Accepts M2MP (binary) and ALIP (text) device connections.

use clap::Parser;
use m2mp_registry::{MemoryRegistry, MemoryTimeSeries};
use m2mp_server::{Config, LocalBus, Server};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "m2mp")]
#[command(about = "Connectivity backend for M2MP telemetry devices")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "M2MP_CONFIG")]
    config: Option<PathBuf>,

    /// Binary M2MP listen address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// ALIP listen address
    #[arg(long)]
    alip_bind: Option<SocketAddr>,

    /// Disable the ALIP listener
    #[arg(long, conflicts_with = "alip_bind")]
    no_alip: bool,

    /// Device registry snapshot file
    #[arg(long)]
    registry_file: Option<PathBuf>,

    /// Directory of firmware files served to devices
    #[arg(long)]
    firmware_dir: Option<PathBuf>,
}

impl Cli {
    fn load_config(&self) -> Result<Config, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => {
                let mut config = Config::from_file(path)?;
                config.apply_env_overrides();
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            None => Config::from_env(),
        };

        if let Some(bind) = self.bind {
            config.network.bind_addr = bind;
        }
        if let Some(alip) = self.alip_bind {
            config.network.alip_bind_addr = Some(alip);
        }
        if self.no_alip {
            config.network.alip_bind_addr = None;
        }
        if let Some(path) = &self.registry_file {
            config.storage.registry_file = Some(path.clone());
        }
        if let Some(dir) = &self.firmware_dir {
            config.storage.firmware_dir = Some(dir.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e);
        }
    };

    tracing::info!("Starting m2mp {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  M2MP address: {}", config.network.bind_addr);
    match config.network.alip_bind_addr {
        Some(addr) => tracing::info!("  ALIP address: {}", addr),
        None => tracing::info!("  ALIP: disabled"),
    }

    let registry = match &config.storage.registry_file {
        Some(path) => {
            tracing::info!("  Registry file: {}", path.display());
            Arc::new(MemoryRegistry::with_persistence(path)?)
        }
        None => {
            tracing::info!("  Registry: in memory only");
            Arc::new(MemoryRegistry::new())
        }
    };
    if let Some(dir) = &config.storage.firmware_dir {
        let count = registry.load_firmware_dir(dir)?;
        tracing::info!("  Firmware: {} file(s) from {}", count, dir.display());
    }

    let store = Arc::new(MemoryTimeSeries::new(config.storage.samples_per_series));
    let bus = Arc::new(LocalBus::new(config.bus.channel_capacity));
    let server = Arc::new(Server::new(config, registry.clone(), store, bus));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    server.run().await?;

    if let Err(e) = registry.persist() {
        tracing::error!("Failed to persist registry on shutdown: {}", e);
    }

    tracing::info!("Server stopped");
    Ok(())
}
