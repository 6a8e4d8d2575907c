//! ---
//! mes_section: "03-persistence-logging"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Durable event sink and read model."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use r_mes_common::{Alarm, FaultReason, LineId, OrderId, OrderState, Verdict};
use serde::Serialize;
use tracing::warn;

use crate::event::{DomainEvent, EventRecord, MeasurementRecorded, QualityRecorded};

/// Persisted view of one production order.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderView {
    pub order_id: OrderId,
    pub line: LineId,
    pub target_quantity: u32,
    pub produced: u32,
    pub state: OrderState,
    pub faulted: Option<FaultReason>,
    pub rework_count: u32,
    pub priority: u32,
    pub materials: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub quality: Vec<QualityRecorded>,
}

/// Persisted view of one conveyor line.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineView {
    pub line: LineId,
    pub assigned_order: Option<OrderId>,
    pub speed_setpoint: Option<f64>,
    pub units_completed: u64,
    pub passed: u64,
    pub failed: u64,
}

impl LineView {
    fn new(line: LineId) -> Self {
        Self {
            line,
            assigned_order: None,
            speed_setpoint: None,
            units_completed: 0,
            passed: 0,
            failed: 0,
        }
    }

    /// Percentage of passed verdicts, if any were recorded.
    pub fn pass_rate(&self) -> Option<f64> {
        let total = self.passed + self.failed;
        (total > 0).then(|| self.passed as f64 * 100.0 / total as f64)
    }
}

/// Last persisted stock levels of a material.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryLevel {
    pub material: String,
    pub on_hand: u64,
    pub reserved: u64,
    /// Sequence of the adjustment these levels come from.
    pub sequence: u64,
}

/// Projection of the event log for dashboards, analytics and restart recovery.
///
/// Applying a record whose `event_id` was already seen is a no-op, so
/// at-least-once delivery converges to the same state.
#[derive(Debug, Default, Clone)]
pub struct ReadModel {
    cursor: u64,
    seen: HashSet<String>,
    sequences: HashMap<String, u64>,
    orders: IndexMap<OrderId, OrderView>,
    lines: BTreeMap<LineId, LineView>,
    alarms: IndexMap<String, Alarm>,
    inventory: BTreeMap<String, InventoryLevel>,
    measurements: BTreeMap<String, (MeasurementRecorded, DateTime<Utc>)>,
}

impl ReadModel {
    /// Empty model at cursor 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one record. Returns `false` for duplicates and undecodable records.
    pub fn apply(&mut self, record: &EventRecord) -> bool {
        self.cursor = self.cursor.max(record.offset);
        if self.seen.contains(&record.event_id) {
            return false;
        }
        let event = match record.decode() {
            Ok(event) => event,
            Err(err) => {
                warn!(event_id = %record.event_id, offset = record.offset, error = %err, "skipping undecodable event");
                return false;
            }
        };
        self.seen.insert(record.event_id.clone());
        let last = self.sequences.entry(record.subject.clone()).or_insert(0);
        *last = (*last).max(record.sequence);

        match event {
            DomainEvent::OrderCreated(created) => {
                self.line_mut(&created.line);
                self.orders
                    .entry(created.order_id.clone())
                    .or_insert_with(|| OrderView {
                        order_id: created.order_id,
                        line: created.line,
                        target_quantity: created.target_quantity,
                        produced: 0,
                        state: OrderState::Created,
                        faulted: None,
                        rework_count: 0,
                        priority: created.priority,
                        materials: created.materials,
                        created_at: created.created_at,
                        completed_at: None,
                        quality: Vec::new(),
                    });
            }
            DomainEvent::OrderTransitioned(transition) => {
                if let Some(order) = self.orders.get_mut(&transition.order_id) {
                    order.state = transition.to;
                    order.produced = transition.produced;
                    order.rework_count = transition.rework_count;
                    if transition.to.is_terminal() {
                        order.completed_at = Some(transition.at);
                        order.faulted = None;
                    }
                }
                let line = self.line_mut(&transition.line);
                if transition.from == OrderState::Queued && transition.to == OrderState::InProgress
                {
                    line.assigned_order = Some(transition.order_id.clone());
                }
                if transition.to.is_terminal()
                    && line.assigned_order.as_ref() == Some(&transition.order_id)
                {
                    line.assigned_order = None;
                }
            }
            DomainEvent::OrderFaulted(faulted) => {
                if let Some(order) = self.orders.get_mut(&faulted.order_id) {
                    order.faulted = Some(faulted.reason);
                }
            }
            DomainEvent::OrderResumed(resumed) => {
                if let Some(order) = self.orders.get_mut(&resumed.order_id) {
                    order.faulted = None;
                }
            }
            DomainEvent::UnitCompleted(unit) => {
                if let Some(order) = self.orders.get_mut(&unit.order_id) {
                    order.produced = unit.produced;
                }
                self.line_mut(&unit.line).units_completed += 1;
            }
            DomainEvent::QualityRecorded(quality) => {
                let line = self.line_mut(&quality.line);
                match quality.verdict {
                    Verdict::Pass => line.passed += 1,
                    Verdict::Fail => line.failed += 1,
                    Verdict::Pending => {}
                }
                if let Some(order) = self.orders.get_mut(&quality.order_id) {
                    order.rework_count = quality.rework_count;
                    order.quality.push(quality);
                }
            }
            DomainEvent::MeasurementRecorded(measurement) => {
                self.measurements.insert(
                    measurement.signal.clone(),
                    (measurement, record.timestamp),
                );
            }
            DomainEvent::AlarmRaised(alarm) => {
                self.alarms.insert(alarm.id.clone(), alarm);
            }
            DomainEvent::AlarmCleared(cleared) => {
                if let Some(alarm) = self.alarms.get_mut(&cleared.alarm_id) {
                    alarm.cleared_at = Some(cleared.cleared_at);
                }
            }
            DomainEvent::AlarmAcknowledged(ack) => {
                if let Some(alarm) = self.alarms.get_mut(&ack.alarm_id) {
                    alarm.acknowledged_at = Some(ack.acknowledged_at);
                }
            }
            DomainEvent::InventoryAdjusted(adjusted) => {
                // Adjustments from different lines may land out of order; levels are absolute.
                let newer = self
                    .inventory
                    .get(&adjusted.material)
                    .map_or(true, |level| level.sequence < record.sequence);
                if newer {
                    self.inventory.insert(
                        adjusted.material.clone(),
                        InventoryLevel {
                            material: adjusted.material,
                            on_hand: adjusted.on_hand,
                            reserved: adjusted.reserved,
                            sequence: record.sequence,
                        },
                    );
                }
            }
            DomainEvent::LineSpeedChanged(speed) => {
                self.line_mut(&speed.line).speed_setpoint = Some(speed.setpoint);
            }
        }
        true
    }

    fn line_mut(&mut self, line: &LineId) -> &mut LineView {
        self.lines
            .entry(line.clone())
            .or_insert_with(|| LineView::new(line.clone()))
    }

    /// Offset of the newest record folded in.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Next unused sequence number for `subject`.
    pub fn next_sequence(&self, subject: &str) -> u64 {
        self.sequences.get(subject).copied().unwrap_or(0) + 1
    }

    /// Point query for an order.
    pub fn order(&self, order_id: &OrderId) -> Option<&OrderView> {
        self.orders.get(order_id)
    }

    /// Orders in creation order.
    pub fn orders(&self) -> impl Iterator<Item = &OrderView> {
        self.orders.values()
    }

    /// Point query for a line.
    pub fn line(&self, line: &LineId) -> Option<&LineView> {
        self.lines.get(line)
    }

    /// All lines seen in the log.
    pub fn lines(&self) -> impl Iterator<Item = &LineView> {
        self.lines.values()
    }

    /// Point query for an alarm.
    pub fn alarm(&self, alarm_id: &str) -> Option<&Alarm> {
        self.alarms.get(alarm_id)
    }

    /// All alarms, oldest first.
    pub fn alarms(&self) -> impl Iterator<Item = &Alarm> {
        self.alarms.values()
    }

    /// Alarms not cleared yet.
    pub fn active_alarms(&self) -> impl Iterator<Item = &Alarm> {
        self.alarms.values().filter(|alarm| alarm.is_active())
    }

    /// Last persisted level of a material.
    pub fn inventory(&self, material: &str) -> Option<&InventoryLevel> {
        self.inventory.get(material)
    }

    /// All persisted inventory levels.
    pub fn inventory_levels(&self) -> impl Iterator<Item = &InventoryLevel> {
        self.inventory.values()
    }

    /// Latest persisted measurement of a signal and when it was recorded.
    pub fn measurement(&self, signal: &str) -> Option<&(MeasurementRecorded, DateTime<Utc>)> {
        self.measurements.get(signal)
    }

    /// Order counts keyed by state label.
    pub fn orders_by_state(&self) -> BTreeMap<&'static str, usize> {
        let mut totals = BTreeMap::new();
        for order in self.orders.values() {
            *totals.entry(order.state.as_str()).or_insert(0) += 1;
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{NewEvent, OrderCreated, OrderTransitioned};

    fn created(order: &str) -> NewEvent {
        NewEvent::new(
            1,
            DomainEvent::OrderCreated(OrderCreated {
                order_id: OrderId::from(order),
                line: LineId::from("C1"),
                target_quantity: 10,
                materials: vec!["steel-casing".into()],
                priority: 1,
                created_at: Utc::now(),
            }),
        )
    }

    fn transition(order: &str, sequence: u64, from: OrderState, to: OrderState) -> NewEvent {
        NewEvent::new(
            sequence,
            DomainEvent::OrderTransitioned(OrderTransitioned {
                order_id: OrderId::from(order),
                line: LineId::from("C1"),
                from,
                to,
                produced: 0,
                rework_count: 0,
                at: Utc::now(),
            }),
        )
    }

    #[test]
    fn duplicate_records_are_ignored() {
        let mut model = ReadModel::new();
        let first = created("PO_1").to_record(1).unwrap();
        let queued = transition("PO_1", 2, OrderState::Created, OrderState::Queued)
            .to_record(2)
            .unwrap();
        assert!(model.apply(&first));
        assert!(model.apply(&queued));
        let once = model.order(&OrderId::from("PO_1")).cloned();

        // redelivered after a crash, at a later offset
        let mut replayed = queued.clone();
        replayed.offset = 3;
        assert!(!model.apply(&replayed));
        assert!(!model.apply(&first));
        assert_eq!(model.order(&OrderId::from("PO_1")).cloned(), once);
        assert_eq!(model.cursor(), 3);
        assert_eq!(model.next_sequence("PO_1"), 3);
    }

    #[test]
    fn assignment_follows_start_and_terminal_states() {
        let mut model = ReadModel::new();
        let events = [
            created("PO_1"),
            transition("PO_1", 2, OrderState::Created, OrderState::Queued),
            transition("PO_1", 3, OrderState::Queued, OrderState::InProgress),
        ];
        for (index, event) in events.iter().enumerate() {
            model.apply(&event.to_record(index as u64 + 1).unwrap());
        }
        let line = LineId::from("C1");
        assert_eq!(
            model.line(&line).unwrap().assigned_order,
            Some(OrderId::from("PO_1"))
        );

        let mut at_check = transition("PO_1", 4, OrderState::InProgress, OrderState::QualityCheck);
        model.apply(&at_check.to_record(4).unwrap());
        at_check = transition("PO_1", 5, OrderState::QualityCheck, OrderState::Scrapped);
        model.apply(&at_check.to_record(5).unwrap());
        assert_eq!(model.line(&line).unwrap().assigned_order, None);
        assert!(model.order(&OrderId::from("PO_1")).unwrap().completed_at.is_some());
        assert_eq!(model.orders_by_state().get("SCRAPPED"), Some(&1));
    }

    #[test]
    fn stale_inventory_snapshots_do_not_regress_levels() {
        use crate::event::InventoryAdjusted;

        let adjusted = |sequence: u64, on_hand: u64| {
            NewEvent::new(
                sequence,
                DomainEvent::InventoryAdjusted(InventoryAdjusted {
                    material: "steel-casing".into(),
                    on_hand,
                    reserved: 0,
                    delta: -1,
                    reason: "consume".into(),
                    order_id: None,
                }),
            )
        };
        let mut model = ReadModel::new();
        model.apply(&adjusted(2, 40).to_record(1).unwrap());
        model.apply(&adjusted(1, 41).to_record(2).unwrap());
        let level = model.inventory("steel-casing").unwrap();
        assert_eq!(level.on_hand, 40);
        assert_eq!(level.sequence, 2);
        assert_eq!(model.next_sequence("inventory/steel-casing"), 3);
    }
}
