//! ---
//! mes_section: "03-persistence-logging"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Durable event sink and read model."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{
    self, CounterVec, Histogram, HistogramOpts, IntCounterVec, Opts, Registry,
};

use crate::Result;

/// Metrics published by the persistence subsystem.
#[derive(Clone)]
pub struct PersistenceMetrics {
    events_appended: IntCounterVec,
    append_failures: IntCounterVec,
    event_log_bytes: CounterVec,
    append_latency: Histogram,
    replay_duration: Histogram,
    #[allow(dead_code)]
    registry: Arc<Registry>,
}

impl PersistenceMetrics {
    /// Register all persistence metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let events_appended = IntCounterVec::new(
            Opts::new(
                "r_mes_events_appended_total",
                "Events durably appended to the event log",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(events_appended.clone()))?;

        let append_failures = IntCounterVec::new(
            Opts::new(
                "r_mes_event_append_failures_total",
                "Event appends that failed and were not acknowledged",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(append_failures.clone()))?;

        let event_log_bytes = CounterVec::new(
            Opts::new(
                "r_mes_event_log_bytes_total",
                "Total bytes appended to the event log",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(event_log_bytes.clone()))?;

        let append_latency = Histogram::with_opts(
            HistogramOpts::new(
                "r_mes_event_append_latency_seconds",
                "Latency of durable event appends",
            )
            .buckets(prometheus::exponential_buckets(0.0005, 2.0, 14)?),
        )?;
        registry.register(Box::new(append_latency.clone()))?;

        let replay_duration = Histogram::with_opts(
            HistogramOpts::new(
                "r_mes_replay_duration_seconds",
                "Duration spent replaying the event log at startup",
            )
            .buckets(prometheus::exponential_buckets(0.001, 2.0, 12)?),
        )?;
        registry.register(Box::new(replay_duration.clone()))?;

        Ok(Self {
            events_appended,
            append_failures,
            event_log_bytes,
            append_latency,
            replay_duration,
            registry,
        })
    }

    /// Record a successful append.
    pub fn record_appended(&self, kind: &str, bytes: usize, seconds: f64) {
        self.events_appended.with_label_values(&[kind]).inc();
        self.event_log_bytes
            .with_label_values(&[kind])
            .inc_by(bytes as f64);
        self.append_latency.observe(seconds);
    }

    /// Record an append that was not acknowledged.
    pub fn record_failure(&self, kind: &str, seconds: f64) {
        self.append_failures.with_label_values(&[kind]).inc();
        self.append_latency.observe(seconds);
    }

    /// Observe the duration spent replaying the log.
    pub fn observe_replay_duration(&self, seconds: f64) {
        self.replay_duration.observe(seconds);
    }
}

impl std::fmt::Debug for PersistenceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceMetrics").finish_non_exhaustive()
    }
}
