//! ---
//! mes_section: "01-core-functionality"
//! mes_subsection: "binary"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Binary entrypoint for the R-MES daemon."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use r_mes_common::{init_tracing, AppConfig, DataKind};
use r_mes_core::MesEngine;
use r_mes_net::{build_adapter, BridgeMetrics, SimulatedDevice, SubscriptionBridge, TagRegistry};
use r_mes_metrics::{new_registry, spawn_http_server, DaemonMetrics, ProductionMetrics};
use r_mes_persistence::{FileEventStore, PersistenceMetrics, PersistenceSink};
use serde_json::{json, Value};
use tokio::signal;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("R-MES ", env!("CARGO_PKG_VERSION")),
    about = "R-MES production integration daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the production engine against simulated field devices")]
    Run,
    #[command(about = "Load and validate the configuration, then exit")]
    CheckConfig,
    #[command(about = "Print persisted events after a cursor as JSON lines")]
    Events {
        #[arg(long, default_value_t = 0, help = "Return events with an offset above this cursor")]
        since: u64,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/example.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let load_duration = load_started.elapsed();
    let config = loaded.config;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("r-mesd", &config.logging)?;
            info!(config_path = %loaded.source.display(), "configuration loaded");
            run_daemon(config, load_duration.as_secs_f64()).await?
        }
        Commands::CheckConfig => {
            println!(
                "{}: ok ({} lines, {} tags, {} endpoints, {} materials)",
                loaded.source.display(),
                config.lines.len(),
                config.tags.len(),
                config.bridge.endpoints.len(),
                config.inventory.len()
            );
        }
        Commands::Events { since, limit } => print_events(&config, since, limit).await?,
    }

    Ok(())
}

async fn run_daemon(config: AppConfig, load_seconds: f64) -> Result<()> {
    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.observe_config_load(load_seconds);
    daemon_metrics.inc_start();
    let profile = if cfg!(debug_assertions) { "debug" } else { "release" };
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"), profile);

    let metrics_enabled = config.metrics.enabled;
    let metrics_server = if metrics_enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };
    let production_metrics = metrics_enabled
        .then(|| ProductionMetrics::new(registry.clone()))
        .transpose()?;
    let bridge_metrics = metrics_enabled
        .then(|| BridgeMetrics::new(registry.clone()))
        .transpose()?;
    let persistence_metrics = metrics_enabled
        .then(|| PersistenceMetrics::new(registry.clone()))
        .transpose()?;

    let log_path = config.persistence.event_log_path();
    std::fs::create_dir_all(&config.persistence.directory).with_context(|| {
        format!(
            "unable to create persistence directory {}",
            config.persistence.directory.display()
        )
    })?;
    let store = FileEventStore::open(&log_path, config.persistence.sync_on_append)
        .with_context(|| format!("unable to open event log {}", log_path.display()))?;
    let sink = PersistenceSink::new(Arc::new(store), persistence_metrics);

    let registry_tags = TagRegistry::from_config(&config.tags, config.bridge.staleness_window)?;
    let adapters = config
        .bridge
        .endpoints
        .iter()
        .map(|(name, endpoint)| {
            let device = seeded_device(&config, name);
            info!(endpoint = %name, protocol = %endpoint.protocol, address = %endpoint.address, "simulated field device bound");
            build_adapter(name, endpoint, device)
        })
        .collect();
    let bridge = SubscriptionBridge::new(
        Arc::new(registry_tags),
        config.bridge.clone(),
        adapters,
        bridge_metrics,
    );

    let engine = MesEngine::start(Arc::new(config), bridge, sink, production_metrics).await?;
    let status = engine.production_status().await?;
    info!(
        lines = status.lines.len(),
        active_alarms = status.active_alarms.len(),
        "daemon running; waiting for termination signal"
    );

    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    engine.shutdown().await;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

/// Device image holding a plausible idle value for every tag of `endpoint`,
/// so the first full read reports `GOOD` signals.
fn seeded_device(config: &AppConfig, endpoint: &str) -> SimulatedDevice {
    let device = SimulatedDevice::new();
    for tag in config.tags.iter().filter(|tag| tag.endpoint == endpoint) {
        let value: Value = match tag.kind {
            DataKind::Boolean => json!(false),
            DataKind::Integer => json!(0),
            DataKind::Float => match config.quality.tolerances.get(&tag.name) {
                Some(band) => json!((band.min + band.max) / 2.0),
                None => json!(0.0),
            },
        };
        device.inject(tag.address.clone(), value);
    }
    device
}

async fn print_events(config: &AppConfig, since: u64, limit: usize) -> Result<()> {
    let log_path = config.persistence.event_log_path();
    if !log_path.exists() {
        eprintln!("no event log at {}", log_path.display());
        return Ok(());
    }
    let store = FileEventStore::open(&log_path, false)
        .with_context(|| format!("unable to open event log {}", log_path.display()))?;
    let sink = PersistenceSink::new(Arc::new(store), None);
    for record in sink.read_since(since, limit).await? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}
