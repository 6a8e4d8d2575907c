//! ---
//! mes_section: "01-core-functionality"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Shared primitives and utilities for the integration engine."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::production::{LineId, OrderId};

/// Alarm priority, most urgent first.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AlarmSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl AlarmSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmSeverity::Critical => "critical",
            AlarmSeverity::High => "high",
            AlarmSeverity::Medium => "medium",
            AlarmSeverity::Low => "low",
        }
    }
}

impl fmt::Display for AlarmSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition an alarm stands for. At most one active alarm exists per condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum AlarmCondition {
    /// Signal kept `STALE`/`BAD` beyond the grace period.
    SignalQuality { signal: String },
    /// Device delivered a payload that does not match the tag's data kind.
    MalformedPayload { signal: String },
    /// Line stuck in `FAULT` beyond the grace period.
    LineFault { line: LineId },
    /// Line running with an active order but no unit progress.
    ConveyorStalled { line: LineId },
    /// Vibration signal above the configured threshold.
    Vibration { signal: String },
    /// Float signal above its configured alarm threshold.
    OverThreshold { signal: String },
    LowInventory { material: String },
    VerdictTimeout { order_id: OrderId },
    WriteRejected { signal: String },
    ConnectionLost { endpoint: String },
    /// A state transition could not be made durable.
    PersistenceFailure { order_id: OrderId },
    /// Sink latency over budget; low-priority signals are being shed.
    PersistenceBackpressure,
    LowPassRate { line: LineId },
}

impl AlarmCondition {
    pub fn kind(&self) -> &'static str {
        match self {
            AlarmCondition::SignalQuality { .. } => "signal_quality",
            AlarmCondition::MalformedPayload { .. } => "malformed_payload",
            AlarmCondition::LineFault { .. } => "line_fault",
            AlarmCondition::ConveyorStalled { .. } => "conveyor_stalled",
            AlarmCondition::Vibration { .. } => "vibration",
            AlarmCondition::OverThreshold { .. } => "over_threshold",
            AlarmCondition::LowInventory { .. } => "low_inventory",
            AlarmCondition::VerdictTimeout { .. } => "verdict_timeout",
            AlarmCondition::WriteRejected { .. } => "write_rejected",
            AlarmCondition::ConnectionLost { .. } => "connection_lost",
            AlarmCondition::PersistenceFailure { .. } => "persistence_failure",
            AlarmCondition::PersistenceBackpressure => "persistence_backpressure",
            AlarmCondition::LowPassRate { .. } => "low_pass_rate",
        }
    }

    /// Signal, order, line, or component the condition refers to.
    pub fn source(&self) -> String {
        match self {
            AlarmCondition::SignalQuality { signal }
            | AlarmCondition::MalformedPayload { signal }
            | AlarmCondition::Vibration { signal }
            | AlarmCondition::OverThreshold { signal }
            | AlarmCondition::WriteRejected { signal } => signal.clone(),
            AlarmCondition::LineFault { line }
            | AlarmCondition::ConveyorStalled { line }
            | AlarmCondition::LowPassRate { line } => line.to_string(),
            AlarmCondition::VerdictTimeout { order_id }
            | AlarmCondition::PersistenceFailure { order_id } => order_id.to_string(),
            AlarmCondition::LowInventory { material } => material.clone(),
            AlarmCondition::ConnectionLost { endpoint } => endpoint.clone(),
            AlarmCondition::PersistenceBackpressure => "persistence".to_owned(),
        }
    }

    pub fn default_severity(&self) -> AlarmSeverity {
        match self {
            AlarmCondition::LineFault { .. }
            | AlarmCondition::PersistenceFailure { .. }
            | AlarmCondition::ConnectionLost { .. } => AlarmSeverity::Critical,
            AlarmCondition::ConveyorStalled { .. }
            | AlarmCondition::VerdictTimeout { .. }
            | AlarmCondition::WriteRejected { .. }
            | AlarmCondition::Vibration { .. }
            | AlarmCondition::OverThreshold { .. } => AlarmSeverity::High,
            AlarmCondition::SignalQuality { .. }
            | AlarmCondition::MalformedPayload { .. }
            | AlarmCondition::PersistenceBackpressure
            | AlarmCondition::LowPassRate { .. } => AlarmSeverity::Medium,
            AlarmCondition::LowInventory { .. } => AlarmSeverity::Low,
        }
    }
}

impl fmt::Display for AlarmCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.source())
    }
}

/// Raised alarm with its lifecycle timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alarm {
    pub id: String,
    pub condition: AlarmCondition,
    pub severity: AlarmSeverity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Alarm {
    pub fn is_active(&self) -> bool {
        self.cleared_at.is_none()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }
}
