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
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{MesError, MesResult};

/// Conveyor line identifier (`C1`, `C2`, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct LineId(String);

impl LineId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LineId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Production order identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build the `PO_<yyyymmdd_hhmmss>_<nnn>` identifier used by the planning layer.
    pub fn generate(created_at: DateTime<Utc>, ordinal: u64) -> Self {
        Self(format!(
            "PO_{}_{:03}",
            created_at.format("%Y%m%d_%H%M%S"),
            ordinal
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Operating mode reported by a conveyor line.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperatingMode {
    Run,
    #[default]
    Stop,
    Fault,
}

impl OperatingMode {
    /// Fault dominates; otherwise the running flag decides.
    pub fn derive(running: bool, fault: bool) -> Self {
        if fault {
            OperatingMode::Fault
        } else if running {
            OperatingMode::Run
        } else {
            OperatingMode::Stop
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Run => "RUN",
            OperatingMode::Stop => "STOP",
            OperatingMode::Fault => "FAULT",
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a production order.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Created,
    Queued,
    InProgress,
    QualityCheck,
    Completed,
    Rework,
    Scrapped,
    Cancelled,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Created => "CREATED",
            OrderState::Queued => "QUEUED",
            OrderState::InProgress => "IN_PROGRESS",
            OrderState::QualityCheck => "QUALITY_CHECK",
            OrderState::Completed => "COMPLETED",
            OrderState::Rework => "REWORK",
            OrderState::Scrapped => "SCRAPPED",
            OrderState::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Completed | OrderState::Scrapped | OrderState::Cancelled
        )
    }

    /// Whether the order holds (or is about to hold) its line.
    pub fn holds_line(&self) -> bool {
        matches!(
            self,
            OrderState::Queued
                | OrderState::InProgress
                | OrderState::QualityCheck
                | OrderState::Rework
        )
    }

    /// Edges of the production state graph.
    pub fn can_transition_to(&self, next: OrderState) -> bool {
        use OrderState::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Created, Cancelled)
                | (Queued, InProgress)
                | (Queued, Cancelled)
                | (InProgress, QualityCheck)
                | (QualityCheck, InProgress)
                | (QualityCheck, Completed)
                | (QualityCheck, Rework)
                | (QualityCheck, Scrapped)
                | (Rework, InProgress)
        )
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the FAULTED overlay is set on an order.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FaultReason {
    LineFault,
    VerdictTimeout,
}

impl FaultReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultReason::LineFault => "line_fault",
            FaultReason::VerdictTimeout => "verdict_timeout",
        }
    }
}

/// Outcome of a quality test.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
    #[default]
    Pending,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::Pending => "PENDING",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality test of one sampled unit. Immutable once the verdict is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityTest {
    pub order_id: OrderId,
    pub unit_sequence: u32,
    pub measurements: IndexMap<String, f64>,
    verdict: Verdict,
    pub requested_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl QualityTest {
    pub fn request(order_id: OrderId, unit_sequence: u32, requested_at: DateTime<Utc>) -> Self {
        Self {
            order_id,
            unit_sequence,
            measurements: IndexMap::new(),
            verdict: Verdict::Pending,
            requested_at,
            decided_at: None,
        }
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn is_decided(&self) -> bool {
        self.verdict != Verdict::Pending
    }

    /// Record the final verdict together with the measurements it was based on.
    pub fn decide(
        &mut self,
        verdict: Verdict,
        measurements: IndexMap<String, f64>,
        decided_at: DateTime<Utc>,
    ) -> MesResult<()> {
        if self.is_decided() {
            return Err(MesError::VerdictAlreadySet {
                order_id: self.order_id.to_string(),
                unit: self.unit_sequence,
            });
        }
        if verdict == Verdict::Pending {
            return Err(MesError::InvalidRequest(
                "PENDING is not a final verdict".into(),
            ));
        }
        self.verdict = verdict;
        self.measurements = measurements;
        self.decided_at = Some(decided_at);
        Ok(())
    }
}

/// Stock level of one material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InventoryItem {
    pub material: String,
    /// Free quantity available for new reservations.
    pub on_hand: u64,
    /// Quantity reserved by queued/active orders and not consumed yet.
    pub reserved: u64,
    pub reorder_threshold: u64,
    /// Quantity drawn per produced unit.
    pub per_unit: u64,
}

impl InventoryItem {
    pub fn below_threshold(&self) -> bool {
        self.on_hand < self.reorder_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_ids_follow_planning_format() {
        let at = DateTime::parse_from_rfc3339("2026-10-19T08:30:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(OrderId::generate(at, 7).as_str(), "PO_20261019_083005_007");
    }

    #[test]
    fn state_graph_rejects_shortcuts() {
        assert!(OrderState::Created.can_transition_to(OrderState::Queued));
        assert!(!OrderState::Created.can_transition_to(OrderState::InProgress));
        assert!(!OrderState::InProgress.can_transition_to(OrderState::Cancelled));
        assert!(!OrderState::QualityCheck.can_transition_to(OrderState::Queued));
        for terminal in [
            OrderState::Completed,
            OrderState::Scrapped,
            OrderState::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(OrderState::InProgress));
        }
    }

    #[test]
    fn verdict_is_write_once() {
        let mut test = QualityTest::request(OrderId::new("PO_1"), 5, Utc::now());
        assert!(test
            .decide(Verdict::Pending, IndexMap::new(), Utc::now())
            .is_err());
        test.decide(Verdict::Fail, IndexMap::new(), Utc::now())
            .unwrap();
        let err = test
            .decide(Verdict::Pass, IndexMap::new(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, MesError::VerdictAlreadySet { unit: 5, .. }));
        assert_eq!(test.verdict(), Verdict::Fail);
    }

    #[test]
    fn mode_derivation_prefers_fault() {
        assert_eq!(OperatingMode::derive(true, true), OperatingMode::Fault);
        assert_eq!(OperatingMode::derive(true, false), OperatingMode::Run);
        assert_eq!(OperatingMode::derive(false, false), OperatingMode::Stop);
    }
}
