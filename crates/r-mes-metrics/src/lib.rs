//! ---
//! mes_section: "03-persistence-logging"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Metrics collection and export utilities."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener.local_addr().unwrap_or(addr);
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Bound address; differs from the configured one when port 0 was requested.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "r_mesd_starts_total",
            "Total number of times the R-MES daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "r_mesd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new(
                "r_mesd_build_info",
                "Build metadata for the running daemon binary",
            ),
            &["version", "profile"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, profile: &str) {
        self.build_info
            .with_label_values(&[version, profile])
            .set(1.0);
    }
}

/// Production-side metrics: order flow, quality, alarms and line queues.
#[derive(Clone, Debug)]
pub struct ProductionMetrics {
    registry: SharedRegistry,
    lines_total: IntGauge,
    order_transitions: IntCounterVec,
    units_completed: IntCounterVec,
    verdicts: IntCounterVec,
    signals_coalesced: IntCounterVec,
    persistence_halts: IntCounterVec,
    alarms_active: IntGaugeVec,
    shedding: IntGauge,
}

impl ProductionMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let lines_total = IntGauge::with_opts(Opts::new(
            "r_mes_lines_total",
            "Number of conveyor lines managed by the engine",
        ))?;
        registry.register(Box::new(lines_total.clone()))?;

        let order_transitions = IntCounterVec::new(
            Opts::new(
                "r_mes_order_transitions_total",
                "Order state transitions by line and target state",
            ),
            &["line", "state"],
        )?;
        registry.register(Box::new(order_transitions.clone()))?;

        let units_completed = IntCounterVec::new(
            Opts::new(
                "r_mes_units_completed_total",
                "Units credited to production orders",
            ),
            &["line"],
        )?;
        registry.register(Box::new(units_completed.clone()))?;

        let verdicts = IntCounterVec::new(
            Opts::new(
                "r_mes_quality_verdicts_total",
                "Quality verdicts by line and outcome",
            ),
            &["line", "verdict"],
        )?;
        registry.register(Box::new(verdicts.clone()))?;

        let signals_coalesced = IntCounterVec::new(
            Opts::new(
                "r_mes_line_signals_coalesced_total",
                "Signal events folded into the latest-value slot because the line queue was full",
            ),
            &["line"],
        )?;
        registry.register(Box::new(signals_coalesced.clone()))?;

        let persistence_halts = IntCounterVec::new(
            Opts::new(
                "r_mes_persistence_halts_total",
                "Order steps halted because the event could not be persisted",
            ),
            &["line"],
        )?;
        registry.register(Box::new(persistence_halts.clone()))?;

        let alarms_active = IntGaugeVec::new(
            Opts::new("r_mes_alarms_active", "Active alarms by severity"),
            &["severity"],
        )?;
        registry.register(Box::new(alarms_active.clone()))?;

        let shedding = IntGauge::with_opts(Opts::new(
            "r_mes_signal_shedding",
            "Indicator (0/1) whether low-priority signals are being shed",
        ))?;
        registry.register(Box::new(shedding.clone()))?;

        Ok(Self {
            registry,
            lines_total,
            order_transitions,
            units_completed,
            verdicts,
            signals_coalesced,
            persistence_halts,
            alarms_active,
            shedding,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn set_line_count(&self, count: usize) {
        self.lines_total.set(count as i64);
    }

    pub fn record_transition(&self, line: &str, state: &str) {
        self.order_transitions
            .with_label_values(&[line, state])
            .inc();
    }

    pub fn record_unit(&self, line: &str) {
        self.units_completed.with_label_values(&[line]).inc();
    }

    pub fn record_verdict(&self, line: &str, verdict: &str) {
        self.verdicts.with_label_values(&[line, verdict]).inc();
    }

    pub fn record_coalesced(&self, line: &str) {
        self.signals_coalesced.with_label_values(&[line]).inc();
    }

    pub fn record_halt(&self, line: &str) {
        self.persistence_halts.with_label_values(&[line]).inc();
    }

    pub fn set_active_alarms(&self, severity: &str, count: usize) {
        self.alarms_active
            .with_label_values(&[severity])
            .set(count as i64);
    }

    pub fn set_shedding(&self, shedding: bool) {
        self.shedding.set(if shedding { 1 } else { 0 });
    }
}

pub use prometheus;
