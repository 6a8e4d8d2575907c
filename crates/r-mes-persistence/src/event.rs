//! ---
//! mes_section: "03-persistence-logging"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Durable event sink and read model."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use r_mes_common::{
    Alarm, AlarmCondition, FaultReason, LineId, OrderId, OrderState, SignalQuality, SignalValue,
    Verdict,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::Result;

/// Discriminant of a persisted event.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Order accepted by the planning interface.
    OrderCreated,
    /// Order moved along the state graph.
    OrderTransitioned,
    /// FAULTED overlay set.
    OrderFaulted,
    /// FAULTED overlay cleared by an operator.
    OrderResumed,
    /// Unit counted against an order.
    UnitCompleted,
    /// Quality verdict recorded for a sampled unit.
    QualityRecorded,
    /// Process measurement.
    MeasurementRecorded,
    /// Alarm raised.
    AlarmRaised,
    /// Alarm cleared.
    AlarmCleared,
    /// Alarm acknowledged by an operator.
    AlarmAcknowledged,
    /// Absolute stock levels after a reservation, consumption or restock.
    InventoryAdjusted,
    /// Conveyor speed setpoint accepted by the PLC.
    LineSpeedChanged,
}

impl EventKind {
    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OrderCreated => "order_created",
            EventKind::OrderTransitioned => "order_transitioned",
            EventKind::OrderFaulted => "order_faulted",
            EventKind::OrderResumed => "order_resumed",
            EventKind::UnitCompleted => "unit_completed",
            EventKind::QualityRecorded => "quality_recorded",
            EventKind::MeasurementRecorded => "measurement_recorded",
            EventKind::AlarmRaised => "alarm_raised",
            EventKind::AlarmCleared => "alarm_cleared",
            EventKind::AlarmAcknowledged => "alarm_acknowledged",
            EventKind::InventoryAdjusted => "inventory_adjusted",
            EventKind::LineSpeedChanged => "line_speed_changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of [`DomainEvent::OrderCreated`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub line: LineId,
    pub target_quantity: u32,
    pub materials: Vec<String>,
    pub priority: u32,
    pub created_at: DateTime<Utc>,
}

/// Payload of [`DomainEvent::OrderTransitioned`]. Carries absolute counters so
/// that applying it twice is harmless.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderTransitioned {
    pub order_id: OrderId,
    pub line: LineId,
    pub from: OrderState,
    pub to: OrderState,
    pub produced: u32,
    pub rework_count: u32,
    pub at: DateTime<Utc>,
}

/// Payload of [`DomainEvent::OrderFaulted`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderFaulted {
    pub order_id: OrderId,
    pub line: LineId,
    pub reason: FaultReason,
}

/// Payload of [`DomainEvent::OrderResumed`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderResumed {
    pub order_id: OrderId,
    pub line: LineId,
}

/// Payload of [`DomainEvent::UnitCompleted`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitCompleted {
    pub order_id: OrderId,
    pub line: LineId,
    /// Produced count after this unit.
    pub produced: u32,
    /// Whether material was drawn for it (re-completed reworked units draw none).
    pub consumed: bool,
}

/// Payload of [`DomainEvent::QualityRecorded`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityRecorded {
    pub order_id: OrderId,
    pub line: LineId,
    pub unit_sequence: u32,
    pub verdict: Verdict,
    pub measurements: IndexMap<String, f64>,
    pub rework_count: u32,
}

/// Payload of [`DomainEvent::MeasurementRecorded`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeasurementRecorded {
    pub signal: String,
    pub line: Option<LineId>,
    pub value: Option<SignalValue>,
    pub quality: SignalQuality,
}

/// Payload of [`DomainEvent::AlarmCleared`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlarmCleared {
    pub alarm_id: String,
    pub condition: AlarmCondition,
    pub cleared_at: DateTime<Utc>,
}

/// Payload of [`DomainEvent::AlarmAcknowledged`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlarmAcknowledged {
    pub alarm_id: String,
    pub acknowledged_at: DateTime<Utc>,
}

/// Payload of [`DomainEvent::InventoryAdjusted`]. Levels are absolute.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryAdjusted {
    pub material: String,
    pub on_hand: u64,
    pub reserved: u64,
    pub delta: i64,
    pub reason: String,
    pub order_id: Option<OrderId>,
}

/// Payload of [`DomainEvent::LineSpeedChanged`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineSpeedChanged {
    pub line: LineId,
    pub setpoint: f64,
}

/// Typed event emitted by the engine.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum DomainEvent {
    OrderCreated(OrderCreated),
    OrderTransitioned(OrderTransitioned),
    OrderFaulted(OrderFaulted),
    OrderResumed(OrderResumed),
    UnitCompleted(UnitCompleted),
    QualityRecorded(QualityRecorded),
    MeasurementRecorded(MeasurementRecorded),
    AlarmRaised(Alarm),
    AlarmCleared(AlarmCleared),
    AlarmAcknowledged(AlarmAcknowledged),
    InventoryAdjusted(InventoryAdjusted),
    LineSpeedChanged(LineSpeedChanged),
}

impl DomainEvent {
    /// Discriminant of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::OrderCreated(_) => EventKind::OrderCreated,
            DomainEvent::OrderTransitioned(_) => EventKind::OrderTransitioned,
            DomainEvent::OrderFaulted(_) => EventKind::OrderFaulted,
            DomainEvent::OrderResumed(_) => EventKind::OrderResumed,
            DomainEvent::UnitCompleted(_) => EventKind::UnitCompleted,
            DomainEvent::QualityRecorded(_) => EventKind::QualityRecorded,
            DomainEvent::MeasurementRecorded(_) => EventKind::MeasurementRecorded,
            DomainEvent::AlarmRaised(_) => EventKind::AlarmRaised,
            DomainEvent::AlarmCleared(_) => EventKind::AlarmCleared,
            DomainEvent::AlarmAcknowledged(_) => EventKind::AlarmAcknowledged,
            DomainEvent::InventoryAdjusted(_) => EventKind::InventoryAdjusted,
            DomainEvent::LineSpeedChanged(_) => EventKind::LineSpeedChanged,
        }
    }

    /// Ordering stream the event belongs to. Sequence numbers are per subject.
    pub fn subject(&self) -> String {
        match self {
            DomainEvent::OrderCreated(e) => e.order_id.to_string(),
            DomainEvent::OrderTransitioned(e) => e.order_id.to_string(),
            DomainEvent::OrderFaulted(e) => e.order_id.to_string(),
            DomainEvent::OrderResumed(e) => e.order_id.to_string(),
            DomainEvent::UnitCompleted(e) => e.order_id.to_string(),
            DomainEvent::QualityRecorded(e) => e.order_id.to_string(),
            DomainEvent::MeasurementRecorded(e) => format!("signal/{}", e.signal),
            DomainEvent::AlarmRaised(_)
            | DomainEvent::AlarmCleared(_)
            | DomainEvent::AlarmAcknowledged(_) => ALARM_SUBJECT.to_owned(),
            DomainEvent::InventoryAdjusted(e) => format!("inventory/{}", e.material),
            DomainEvent::LineSpeedChanged(e) => format!("line/{}", e.line),
        }
    }
}

/// Subject shared by all alarm lifecycle events.
pub const ALARM_SUBJECT: &str = "alarms";

/// Event handed to the sink. The sink assigns the log offset.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Ordering stream.
    pub subject: String,
    /// Per-subject monotonic sequence number.
    pub sequence: u64,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Typed content.
    pub event: DomainEvent,
}

impl NewEvent {
    /// Wrap `event` with its subject and the producer-assigned sequence.
    pub fn new(sequence: u64, event: DomainEvent) -> Self {
        Self {
            subject: event.subject(),
            sequence,
            timestamp: Utc::now(),
            event,
        }
    }

    /// Idempotency key: `<subject>:<sequence>`.
    pub fn event_id(&self) -> String {
        format!("{}:{}", self.subject, self.sequence)
    }

    /// Discriminant of the wrapped event.
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    /// Serialise into the stored record shape at `offset`.
    pub fn to_record(&self, offset: u64) -> Result<EventRecord> {
        let mut tagged = serde_json::to_value(&self.event)?;
        let payload = tagged
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(EventRecord {
            offset,
            event_id: self.event_id(),
            subject: self.subject.clone(),
            kind: self.kind(),
            payload,
            timestamp: self.timestamp,
            sequence: self.sequence,
        })
    }
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Global position in the log, starting at 1. Used as the read cursor.
    pub offset: u64,
    /// `<subject>:<sequence>`; duplicates of the same id are the same event.
    pub event_id: String,
    /// Order id, `signal/<name>`, `inventory/<material>`, `line/<id>` or `alarms`.
    pub subject: String,
    /// Discriminant.
    pub kind: EventKind,
    /// Kind-specific body.
    pub payload: Value,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Per-subject sequence number.
    pub sequence: u64,
}

impl EventRecord {
    /// Decode the typed event back out of the record.
    pub fn decode(&self) -> Result<DomainEvent> {
        Ok(serde_json::from_value(json!({
            "kind": self.kind,
            "payload": self.payload,
        }))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_decode_back_to_typed_events() {
        let event = NewEvent::new(
            3,
            DomainEvent::LineSpeedChanged(LineSpeedChanged {
                line: LineId::from("C1"),
                setpoint: 1.25,
            }),
        );
        let record = event.to_record(17).unwrap();
        assert_eq!(record.event_id, "line/C1:3");
        assert_eq!(record.kind, EventKind::LineSpeedChanged);
        assert_eq!(record.payload["setpoint"], json!(1.25));
        assert_eq!(record.decode().unwrap(), event.event);
    }

    #[test]
    fn order_events_share_the_order_subject() {
        let order_id = OrderId::from("PO_20261019_080000_001");
        let created = DomainEvent::OrderResumed(OrderResumed {
            order_id: order_id.clone(),
            line: LineId::from("C2"),
        });
        assert_eq!(created.subject(), order_id.as_str());
        assert_eq!(
            NewEvent::new(1, created).event_id(),
            "PO_20261019_080000_001:1"
        );
    }
}
