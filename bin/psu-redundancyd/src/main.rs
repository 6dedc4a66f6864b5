//! ---
//! psu_section: "01-core-functionality"
//! psu_subsection: "binary"
//! psu_type: "source"
//! psu_scope: "code"
//! psu_description: "Binary entrypoint for the PSU cold-redundancy daemon."
//! psu_version: "v0.0.0-prealpha"
//! psu_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use psu_common::config::{AppConfig, Mode, SimulationConfig};
use psu_common::logging::init_tracing;
use psu_metrics::{new_registry, spawn_http_server, DaemonMetrics, RedundancyMetrics};
use psu_redundancy::ranking::platform_preview;
use psu_redundancy::{
    validate_records, EngineSettings, FileHealthFeed, FileInventory, InventorySource,
    PsuDescriptor, RedundancyEngine, RedundancyHandle, RedundancyPolicy, SharedPolicy,
};
use psu_transport::{DeviceAddress, PmbusTransport, SimulatedPmbus};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "PSU cold-redundancy daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override application mode")]
    mode: Option<CliMode>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    Production,
    Simulation,
}

impl From<CliMode> for Mode {
    fn from(value: CliMode) -> Self {
        match value {
            CliMode::Production => Mode::Production,
            CliMode::Simulation => Mode::Simulation,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the redundancy engine")]
    Run,
    #[command(about = "Load configuration and inventory, print the resulting ranking and exit")]
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/example.toml"));
    candidates.push(PathBuf::from("/etc/psu-redundancy/config.toml"));

    let load_started = Instant::now();
    let loaded_config = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded_config.config;
    let config_path = loaded_config.source;
    let load_duration = load_started.elapsed();

    if let Some(mode) = cli.mode {
        config.mode = mode.into();
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("psu-redundancyd", &config.logging)?;
            info!(config = %config_path.display(), mode = ?config.mode, "configuration loaded");
            run_daemon(config, load_duration.as_secs_f64()).await?
        }
        Commands::Validate => validate(&config, &config_path)?,
    }

    Ok(())
}

async fn run_daemon(config: AppConfig, config_load_seconds: f64) -> Result<()> {
    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(&metrics_registry)?;
    daemon_metrics.observe_config_load(config_load_seconds);
    daemon_metrics.inc_start();
    let engine_metrics = RedundancyMetrics::new(&metrics_registry)?;

    let transport = build_transport(&config)?;
    let policy = SharedPolicy::new(RedundancyPolicy::from_config(&config.redundancy));
    let inventory = FileInventory::new(config.inventory.path.clone());
    let engine = RedundancyEngine::new(
        EngineSettings::from_config(&config.redundancy),
        policy,
        transport,
        Box::new(inventory),
        engine_metrics,
    );

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(metrics_registry.clone(), config.metrics.listen).await?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let (handle, engine_task) = engine.spawn();

    let _inventory_watcher = if config.inventory.watch {
        let handle = handle.clone();
        let metrics = daemon_metrics.clone();
        watch_or_warn(&config.inventory.path, "inventory", move || {
            metrics.inc_inventory_event();
            if handle.try_notify_inventory_changed().is_err() {
                warn!("inventory changed but redundancy engine is stopped");
            }
        })
    } else {
        None
    };

    let _health_watcher = match &config.health.path {
        Some(path) => {
            let feed = FileHealthFeed::new(path.clone());
            forward_initial_health(&feed, &handle, &daemon_metrics).await;
            if config.health.watch {
                let handle = handle.clone();
                let metrics = daemon_metrics.clone();
                watch_or_warn(path, "health feed", move || {
                    forward_health(&feed, &handle, &metrics)
                })
            } else {
                None
            }
        }
        None => {
            info!("no health feed configured; health follows inventory discovery");
            None
        }
    };

    info!(mode = ?config.mode, "daemon running; waiting for termination signal");
    shutdown_signal().await;
    info!("termination requested; shutting down");

    if handle.shutdown().await.is_err() {
        warn!("redundancy engine already stopped");
    }
    engine_task.await.context("redundancy engine task failed")?;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    Ok(())
}

fn build_transport(config: &AppConfig) -> Result<Arc<dyn PmbusTransport>> {
    if !config.mode.is_simulation() {
        bail!("production mode needs a platform PMBus backend and none is built in; run with --mode simulation");
    }
    let bus = SimulatedPmbus::new(config.redundancy.transport_timeout)
        .with_journal_capacity(config.simulation.journal_capacity);
    inject_faults(&bus, &config.simulation);
    info!(
        timeout_ms = config.redundancy.transport_timeout.as_millis() as u64,
        failing_writes = config.simulation.failing_writes.len(),
        failing_reads = config.simulation.failing_reads.len(),
        journal_capacity = config.simulation.journal_capacity,
        "simulated PMBus ready"
    );
    Ok(Arc::new(bus))
}

fn inject_faults(bus: &SimulatedPmbus, simulation: &SimulationConfig) {
    for device in &simulation.failing_writes {
        bus.fail_writes(DeviceAddress::new(device.bus, device.address), true);
    }
    for device in &simulation.failing_reads {
        bus.fail_reads(DeviceAddress::new(device.bus, device.address), true);
    }
}

async fn forward_initial_health(
    feed: &FileHealthFeed,
    handle: &RedundancyHandle,
    metrics: &DaemonMetrics,
) {
    let reports = match feed.read() {
        Ok(reports) => reports,
        Err(err) => {
            warn!(error = %err, "initial health feed unavailable");
            return;
        }
    };
    metrics.add_health_reports(reports.len());
    for report in reports {
        if handle.report_health(report.name, report.health).await.is_err() {
            warn!("redundancy engine stopped before initial health was delivered");
            return;
        }
    }
}

/// Re-read the health document and hand every entry to the engine. Runs on
/// the watcher thread.
fn forward_health(feed: &FileHealthFeed, handle: &RedundancyHandle, metrics: &DaemonMetrics) {
    let reports = match feed.read() {
        Ok(reports) => reports,
        Err(err) => {
            warn!(error = %err, path = %feed.path().display(), "health feed unreadable; keeping current health");
            return;
        }
    };
    metrics.add_health_reports(reports.len());
    for report in reports {
        if handle
            .report_health_blocking(report.name, report.health)
            .is_err()
        {
            warn!("health changed but redundancy engine is stopped");
            return;
        }
    }
}

fn watch_or_warn<F>(path: &Path, what: &'static str, on_change: F) -> Option<RecommendedWatcher>
where
    F: Fn() + Send + 'static,
{
    match watch_file(path, what, on_change) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!(error = %err, path = %path.display(), what, "file watch unavailable; changes require a restart");
            None
        }
    }
}

/// Call `on_change` whenever `path` is created, modified or removed.
fn watch_file<F>(path: &Path, what: &'static str, on_change: F) -> Result<RecommendedWatcher>
where
    F: Fn() + Send + 'static,
{
    let target = path.file_name().map(|name| name.to_os_string());
    let watch_dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let relevant = matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) && event
                .paths
                .iter()
                .any(|changed| changed.file_name() == target.as_deref());
            if relevant {
                on_change();
            }
        }
        Err(err) => warn!(error = %err, what, "file watch error"),
    })
    .with_context(|| format!("failed to create {} watcher", what))?;

    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", watch_dir.display()))?;
    info!(directory = %watch_dir.display(), what, "watching for changes");
    Ok(watcher)
}

#[derive(Serialize)]
struct ValidationReport {
    config_source: PathBuf,
    mode: Mode,
    register: u8,
    policy: RedundancyPolicy,
    power_supplies: Vec<PlannedSupply>,
}

#[derive(Serialize)]
struct PlannedSupply {
    #[serde(flatten)]
    descriptor: PsuDescriptor,
    platform_rank: u8,
}

fn validate(config: &AppConfig, config_path: &Path) -> Result<()> {
    let mut inventory = FileInventory::new(config.inventory.path.clone());
    let records = inventory
        .discover()
        .with_context(|| format!("failed to load inventory {}", config.inventory.path.display()))?;
    let descriptors = validate_records(records);
    let ranks = platform_preview(&descriptors);

    let report = ValidationReport {
        config_source: config_path.to_path_buf(),
        mode: config.mode,
        register: config.redundancy.register,
        policy: RedundancyPolicy::from_config(&config.redundancy),
        power_supplies: descriptors
            .into_iter()
            .zip(ranks)
            .map(|(descriptor, platform_rank)| PlannedSupply {
                descriptor,
                platform_rank,
            })
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => warn!(?err, "failed to install SIGTERM handler"),
    }
}
