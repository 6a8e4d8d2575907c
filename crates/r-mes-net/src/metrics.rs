//! ---
//! mes_section: "05-networking-external-interfaces"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Field connectivity, tag registry, and device adapters."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

/// Metrics published by the subscription bridge.
#[derive(Clone)]
pub struct BridgeMetrics {
    events_delivered: IntCounterVec,
    events_shed: IntCounterVec,
    malformed_payloads: IntCounterVec,
    reconnect_attempts: IntCounterVec,
    connected: IntGaugeVec,
}

impl BridgeMetrics {
    /// Register bridge metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let events_delivered = IntCounterVec::new(
            Opts::new(
                "r_mes_bridge_events_delivered_total",
                "Signal events delivered to subscribers",
            ),
            &["endpoint", "origin"],
        )?;
        registry.register(Box::new(events_delivered.clone()))?;

        let events_shed = IntCounterVec::new(
            Opts::new(
                "r_mes_bridge_events_shed_total",
                "Low-priority signal events dropped under backpressure",
            ),
            &["endpoint"],
        )?;
        registry.register(Box::new(events_shed.clone()))?;

        let malformed_payloads = IntCounterVec::new(
            Opts::new(
                "r_mes_bridge_malformed_payloads_total",
                "Device payloads that did not decode to the declared kind",
            ),
            &["endpoint"],
        )?;
        registry.register(Box::new(malformed_payloads.clone()))?;

        let reconnect_attempts = IntCounterVec::new(
            Opts::new(
                "r_mes_bridge_reconnect_attempts_total",
                "Reconnect attempts by outcome",
            ),
            &["endpoint", "outcome"],
        )?;
        registry.register(Box::new(reconnect_attempts.clone()))?;

        let connected = IntGaugeVec::new(
            Opts::new(
                "r_mes_bridge_connected",
                "Whether a session to the endpoint is up",
            ),
            &["endpoint"],
        )?;
        registry.register(Box::new(connected.clone()))?;

        Ok(Self {
            events_delivered,
            events_shed,
            malformed_payloads,
            reconnect_attempts,
            connected,
        })
    }

    pub(crate) fn delivered(&self, endpoint: &str, origin: &str) {
        self.events_delivered
            .with_label_values(&[endpoint, origin])
            .inc();
    }

    pub(crate) fn shed(&self, endpoint: &str) {
        self.events_shed.with_label_values(&[endpoint]).inc();
    }

    pub(crate) fn malformed(&self, endpoint: &str) {
        self.malformed_payloads.with_label_values(&[endpoint]).inc();
    }

    pub(crate) fn reconnect(&self, endpoint: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.reconnect_attempts
            .with_label_values(&[endpoint, outcome])
            .inc();
    }

    pub(crate) fn set_connected(&self, endpoint: &str, up: bool) {
        self.connected
            .with_label_values(&[endpoint])
            .set(i64::from(up));
    }
}

impl std::fmt::Debug for BridgeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeMetrics").finish_non_exhaustive()
    }
}
