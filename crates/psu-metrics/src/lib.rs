//! ---
//! psu_section: "03-logging-metrics"
//! psu_subsection: "module"
//! psu_type: "source"
//! psu_scope: "code"
//! psu_description: "Metrics collection and export utilities."
//! psu_version: "v0.0.0-prealpha"
//! psu_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Encode every metric family in the Prometheus text exposition format.
pub fn render(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("failed to encode metrics")?;
    String::from_utf8(buffer).context("encoded metrics are not utf-8")
}

async fn scrape(State(registry): State<SharedRegistry>) -> Response {
    match render(&registry) {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(err) => {
            error!(error = %err, "metrics scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

/// Bind `addr` and serve `/metrics` and `/healthz` until [`MetricsServer::shutdown`].
pub async fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener {addr}"))?;
    let local = listener
        .local_addr()
        .context("metrics listener has no local address")?;

    let app = Router::new()
        .route("/metrics", get(scrape))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(registry);

    let (stop, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stopped.wait_for(|stop| *stop).await;
            })
            .await
            .context("metrics server failed")
    });

    info!(address = %local, "metrics exporter listening");
    Ok(MetricsServer {
        addr: local,
        stop,
        task,
    })
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Address actually bound, with the port resolved when `0` was requested.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.stop.send(true);
        self.task.await.context("metrics server task panicked")?
    }
}

/// Process-level metrics of the daemon binary.
#[derive(Clone)]
pub struct DaemonMetrics {
    starts: IntCounter,
    config_load_seconds: Histogram,
    inventory_events: IntCounter,
    health_reports: IntCounter,
}

impl DaemonMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let starts = IntCounter::with_opts(Opts::new(
            "psu_redundancyd_starts_total",
            "Times the redundancy daemon has initialised",
        ))?;
        registry.register(Box::new(starts.clone()))?;

        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "psu_redundancyd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let inventory_events = IntCounter::with_opts(Opts::new(
            "psu_redundancyd_inventory_events_total",
            "Inventory file events forwarded to the engine",
        ))?;
        registry.register(Box::new(inventory_events.clone()))?;

        let health_reports = IntCounter::with_opts(Opts::new(
            "psu_redundancyd_health_reports_total",
            "Health feed entries forwarded to the engine",
        ))?;
        registry.register(Box::new(health_reports.clone()))?;

        Ok(Self {
            starts,
            config_load_seconds,
            inventory_events,
            health_reports,
        })
    }

    pub fn inc_start(&self) {
        self.starts.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn inc_inventory_event(&self) {
        self.inventory_events.inc();
    }

    pub fn add_health_reports(&self, count: usize) {
        self.health_reports.inc_by(count as u64);
    }
}

/// Counters and gauges published by the redundancy engine.
#[derive(Clone, Debug)]
pub struct RedundancyMetrics {
    register_writes: IntCounterVec,
    register_read_failures: IntCounter,
    rotations: IntCounter,
    reconfigurations: IntCounterVec,
    staged_dropped: IntCounterVec,
    rebuilds: IntCounter,
    generation: IntGauge,
    ranked_psus: IntGauge,
}

impl RedundancyMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let register_writes = IntCounterVec::new(
            Opts::new(
                "psu_cold_redundancy_writes_total",
                "Cold-redundancy register writes by batch and outcome",
            ),
            &["batch", "outcome"],
        )?;
        registry.register(Box::new(register_writes.clone()))?;

        let register_read_failures = IntCounter::with_opts(Opts::new(
            "psu_cold_redundancy_read_failures_total",
            "Failed read-backs of the cold-redundancy register",
        ))?;
        registry.register(Box::new(register_read_failures.clone()))?;

        let rotations = IntCounter::with_opts(Opts::new(
            "psu_cold_redundancy_rotations_total",
            "Completed rank rotations",
        ))?;
        registry.register(Box::new(rotations.clone()))?;

        let reconfigurations = IntCounterVec::new(
            Opts::new(
                "psu_cold_redundancy_reconfigurations_total",
                "Staged reconfigurations by trigger",
            ),
            &["trigger"],
        )?;
        registry.register(Box::new(reconfigurations.clone()))?;

        let staged_dropped = IntCounterVec::new(
            Opts::new(
                "psu_cold_redundancy_staged_dropped_total",
                "Staged operations abandoned before apply",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(staged_dropped.clone()))?;

        let rebuilds = IntCounter::with_opts(Opts::new(
            "psu_registry_rebuilds_total",
            "Device registry rebuilds",
        ))?;
        registry.register(Box::new(rebuilds.clone()))?;

        let generation = IntGauge::with_opts(Opts::new(
            "psu_registry_generation",
            "Current device registry generation",
        ))?;
        registry.register(Box::new(generation.clone()))?;

        let ranked_psus = IntGauge::with_opts(Opts::new(
            "psu_cold_redundancy_ranked",
            "Power supplies holding a nonzero rank",
        ))?;
        registry.register(Box::new(ranked_psus.clone()))?;

        Ok(Self {
            register_writes,
            register_read_failures,
            rotations,
            reconfigurations,
            staged_dropped,
            rebuilds,
            generation,
            ranked_psus,
        })
    }

    /// Metrics bound to a private registry, for engines nobody scrapes.
    pub fn detached() -> Result<Self> {
        Self::new(&Registry::new())
    }

    pub fn record_write(&self, batch: &str, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        self.register_writes
            .with_label_values(&[batch, outcome])
            .inc();
    }

    pub fn record_read_failure(&self) {
        self.register_read_failures.inc();
    }

    pub fn record_rotation(&self) {
        self.rotations.inc();
    }

    pub fn record_reconfiguration(&self, trigger: &str) {
        self.reconfigurations.with_label_values(&[trigger]).inc();
    }

    pub fn record_staged_dropped(&self, reason: &str) {
        self.staged_dropped.with_label_values(&[reason]).inc();
    }

    pub fn record_rebuild(&self, generation: u64) {
        self.rebuilds.inc();
        self.generation.set(generation as i64);
    }

    pub fn set_ranked(&self, count: usize) {
        self.ranked_psus.set(count as i64);
    }

    pub fn writes(&self, batch: &str, ok: bool) -> u64 {
        let outcome = if ok { "ok" } else { "error" };
        self.register_writes
            .with_label_values(&[batch, outcome])
            .get()
    }

    pub fn dropped(&self, reason: &str) -> u64 {
        self.staged_dropped.with_label_values(&[reason]).get()
    }
}
