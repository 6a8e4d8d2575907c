//! ---
//! mes_section: "01-core-functionality"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Production order lifecycle."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
//! Production order state machine.
//!
//! Every change to an order is expressed as a [`Step`]. A step is turned into
//! an event, appended to the log, and only then applied, so the in-memory order
//! never runs ahead of what is durable.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use r_mes_common::{
    FaultReason, LineId, MesError, MesResult, OrderId, OrderState, QualityTest, Verdict,
};
use r_mes_persistence::{
    DomainEvent, NewEvent, OrderCreated, OrderFaulted, OrderResumed, OrderTransitioned, OrderView,
    QualityRecorded, UnitCompleted,
};
use serde::Serialize;
use tokio::time::Instant;

/// One durable change to an order.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Created(OrderCreated),
    Transition(OrderTransitioned),
    Unit(UnitCompleted),
    Verdict(QualityRecorded),
    Fault(OrderFaulted),
    Resume(OrderResumed),
}

impl Step {
    pub fn to_event(&self) -> DomainEvent {
        match self.clone() {
            Step::Created(created) => DomainEvent::OrderCreated(created),
            Step::Transition(transition) => DomainEvent::OrderTransitioned(transition),
            Step::Unit(unit) => DomainEvent::UnitCompleted(unit),
            Step::Verdict(verdict) => DomainEvent::QualityRecorded(verdict),
            Step::Fault(faulted) => DomainEvent::OrderFaulted(faulted),
            Step::Resume(resumed) => DomainEvent::OrderResumed(resumed),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Step::Created(_) => "created",
            Step::Transition(_) => "transition",
            Step::Unit(_) => "unit",
            Step::Verdict(_) => "verdict",
            Step::Fault(_) => "fault",
            Step::Resume(_) => "resume",
        }
    }
}

/// Read-only view of an order for the planning interface.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OrderSnapshot {
    pub order_id: OrderId,
    pub line: LineId,
    pub state: OrderState,
    pub faulted: Option<FaultReason>,
    pub produced: u32,
    pub target_quantity: u32,
    pub rework_count: u32,
    pub priority: u32,
    pub materials: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Unit waiting for a verdict, if any.
    pub awaiting_verdict: Option<u32>,
    /// Whether a step is waiting to be made durable.
    pub deferred: bool,
    /// Why a `CREATED` order cannot be queued yet, e.g. insufficient material.
    pub blocked: Option<String>,
    pub quality: Vec<QualityTest>,
    pub history: Vec<OrderState>,
}

/// A production order owned by its line worker.
#[derive(Debug, Clone)]
pub struct ProductionOrder {
    pub id: OrderId,
    pub line: LineId,
    pub target_quantity: u32,
    pub materials: Vec<String>,
    pub priority: u32,
    pub created_at: DateTime<Utc>,
    state: OrderState,
    produced: u32,
    rework_count: u32,
    faulted: Option<FaultReason>,
    completed_at: Option<DateTime<Utc>>,
    reserved_units: u32,
    pending_test: Option<QualityTest>,
    tests: Vec<QualityTest>,
    reworked_unit: Option<u32>,
    verdict_deadline: Option<Instant>,
    sample_mark: u64,
    deferred: Option<Step>,
    next_sequence: u64,
    history: Vec<OrderState>,
}

impl ProductionOrder {
    pub fn new(
        id: OrderId,
        line: LineId,
        target_quantity: u32,
        materials: Vec<String>,
        priority: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            line,
            target_quantity,
            materials,
            priority,
            created_at,
            state: OrderState::Created,
            produced: 0,
            rework_count: 0,
            faulted: None,
            completed_at: None,
            reserved_units: 0,
            pending_test: None,
            tests: Vec::new(),
            reworked_unit: None,
            verdict_deadline: None,
            sample_mark: 0,
            deferred: None,
            next_sequence: 1,
            history: vec![OrderState::Created],
        }
    }

    /// Rebuild an order from its projection after a restart.
    ///
    /// Orders past `QUEUED` still hold the reservation for every unit not built
    /// yet. An order caught in `REWORK` gets its return to `IN_PROGRESS`
    /// deferred so the worker commits it before anything else.
    pub fn restore(view: &OrderView, next_sequence: u64) -> Self {
        let mut order = Self::new(
            view.order_id.clone(),
            view.line.clone(),
            view.target_quantity,
            view.materials.clone(),
            view.priority,
            view.created_at,
        );
        order.state = view.state;
        order.produced = view.produced;
        order.rework_count = view.rework_count;
        order.faulted = view.faulted;
        order.completed_at = view.completed_at;
        order.next_sequence = next_sequence;
        order.history = vec![view.state];
        if view.state.holds_line() {
            order.reserved_units = view.target_quantity.saturating_sub(view.produced);
        }
        if view.state == OrderState::QualityCheck {
            order.pending_test = Some(QualityTest::request(
                view.order_id.clone(),
                view.produced,
                Utc::now(),
            ));
        }
        if view.state == OrderState::Rework {
            if let Ok(step) = order.transition(OrderState::InProgress) {
                order.deferred = Some(step);
            }
        }
        order
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    pub fn produced(&self) -> u32 {
        self.produced
    }

    pub fn rework_count(&self) -> u32 {
        self.rework_count
    }

    pub fn faulted(&self) -> Option<FaultReason> {
        self.faulted
    }

    pub fn reserved_units(&self) -> u32 {
        self.reserved_units
    }

    pub fn pending_test(&self) -> Option<&QualityTest> {
        self.pending_test.as_ref()
    }

    pub fn history(&self) -> &[OrderState] {
        &self.history
    }

    /// Counting units against this order is allowed.
    pub fn is_active(&self) -> bool {
        self.state == OrderState::InProgress && self.faulted.is_none() && self.deferred.is_none()
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred.is_some()
    }

    pub fn deferred_step(&self) -> Option<&Step> {
        self.deferred.as_ref()
    }

    pub(crate) fn defer(&mut self, step: Step) {
        self.deferred = Some(step);
    }

    pub(crate) fn take_deferred(&mut self) -> Option<Step> {
        self.deferred.take()
    }

    pub fn verdict_deadline(&self) -> Option<Instant> {
        self.verdict_deadline
    }

    /// Arrival mark after which measurements count for the pending sample.
    pub fn sample_mark(&self) -> u64 {
        self.sample_mark
    }

    pub(crate) fn arm_verdict(&mut self, deadline: Instant, sample_mark: u64) {
        self.verdict_deadline = Some(deadline);
        self.sample_mark = sample_mark;
    }

    pub(crate) fn rearm_verdict(&mut self, deadline: Instant) {
        if self.state == OrderState::QualityCheck {
            self.verdict_deadline = Some(deadline);
        }
    }

    /// Hand back the remaining reservation; the caller releases it.
    pub(crate) fn settle_reservation(&mut self) -> u32 {
        std::mem::take(&mut self.reserved_units)
    }

    /// Wrap `step` into the next event of this order's stream.
    pub fn next_event(&self, step: &Step) -> NewEvent {
        NewEvent::new(self.next_sequence, step.to_event())
    }

    pub fn created_step(&self) -> Step {
        Step::Created(OrderCreated {
            order_id: self.id.clone(),
            line: self.line.clone(),
            target_quantity: self.target_quantity,
            materials: self.materials.clone(),
            priority: self.priority,
            created_at: self.created_at,
        })
    }

    /// Build the transition to `to`, rejecting edges outside the state graph.
    pub fn transition(&self, to: OrderState) -> MesResult<Step> {
        if !self.state.can_transition_to(to) {
            return Err(MesError::InvalidTransition {
                order_id: self.id.to_string(),
                from: self.state.to_string(),
                attempted: to.to_string(),
            });
        }
        let (produced, rework_count) = match (self.state, to) {
            // the sampled unit is built again
            (OrderState::Rework, OrderState::InProgress) => {
                (self.produced.saturating_sub(1), self.rework_count)
            }
            (OrderState::QualityCheck, OrderState::Rework) => {
                (self.produced, self.rework_count + 1)
            }
            _ => (self.produced, self.rework_count),
        };
        Ok(Step::Transition(OrderTransitioned {
            order_id: self.id.clone(),
            line: self.line.clone(),
            from: self.state,
            to,
            produced,
            rework_count,
            at: Utc::now(),
        }))
    }

    /// Next unit, or `None` once the target is reached.
    pub fn unit_step(&self) -> Option<Step> {
        let unit = self.produced + 1;
        if unit > self.target_quantity {
            return None;
        }
        Some(Step::Unit(UnitCompleted {
            order_id: self.id.clone(),
            line: self.line.clone(),
            produced: unit,
            consumed: self.reworked_unit != Some(unit),
        }))
    }

    pub fn verdict_step(&self, verdict: Verdict, measurements: IndexMap<String, f64>) -> MesResult<Step> {
        let Some(test) = self
            .pending_test
            .as_ref()
            .filter(|_| self.state == OrderState::QualityCheck)
        else {
            return Err(MesError::InvalidTransition {
                order_id: self.id.to_string(),
                from: self.state.to_string(),
                attempted: format!("verdict {verdict}"),
            });
        };
        if test.is_decided() {
            return Err(MesError::VerdictAlreadySet {
                order_id: self.id.to_string(),
                unit: test.unit_sequence,
            });
        }
        Ok(Step::Verdict(QualityRecorded {
            order_id: self.id.clone(),
            line: self.line.clone(),
            unit_sequence: test.unit_sequence,
            verdict,
            measurements,
            rework_count: self.rework_count,
        }))
    }

    pub fn fault_step(&self, reason: FaultReason) -> Step {
        Step::Fault(OrderFaulted {
            order_id: self.id.clone(),
            line: self.line.clone(),
            reason,
        })
    }

    pub fn resume_step(&self) -> Step {
        Step::Resume(OrderResumed {
            order_id: self.id.clone(),
            line: self.line.clone(),
        })
    }

    /// Apply a step that has been made durable.
    pub fn apply(&mut self, step: &Step) {
        match step {
            Step::Created(_) => {}
            Step::Transition(transition) => {
                if transition.from == OrderState::Rework && transition.to == OrderState::InProgress {
                    self.reworked_unit = Some(self.produced);
                }
                self.state = transition.to;
                self.produced = transition.produced;
                self.rework_count = transition.rework_count;
                self.history.push(transition.to);
                match transition.to {
                    OrderState::Queued => self.reserved_units = self.target_quantity,
                    OrderState::QualityCheck => {
                        self.pending_test = Some(QualityTest::request(
                            self.id.clone(),
                            self.produced,
                            transition.at,
                        ));
                    }
                    state if state.is_terminal() => {
                        self.completed_at = Some(transition.at);
                        self.faulted = None;
                        self.pending_test = None;
                        self.verdict_deadline = None;
                    }
                    _ => {}
                }
            }
            Step::Unit(unit) => {
                self.produced = unit.produced;
                if unit.consumed {
                    self.reserved_units = self.reserved_units.saturating_sub(1);
                } else {
                    self.reworked_unit = None;
                }
            }
            Step::Verdict(recorded) => {
                if let Some(mut test) = self.pending_test.take() {
                    if test
                        .decide(recorded.verdict, recorded.measurements.clone(), Utc::now())
                        .is_ok()
                    {
                        self.tests.push(test);
                    }
                }
                self.verdict_deadline = None;
            }
            Step::Fault(faulted) => {
                self.faulted = Some(faulted.reason);
                self.verdict_deadline = None;
            }
            Step::Resume(_) => self.faulted = None,
        }
        self.next_sequence += 1;
    }

    pub fn snapshot(&self) -> OrderSnapshot {
        OrderSnapshot {
            order_id: self.id.clone(),
            line: self.line.clone(),
            state: self.state,
            faulted: self.faulted,
            produced: self.produced,
            target_quantity: self.target_quantity,
            rework_count: self.rework_count,
            priority: self.priority,
            materials: self.materials.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
            awaiting_verdict: self.pending_test.as_ref().map(|test| test.unit_sequence),
            deferred: self.deferred.is_some(),
            blocked: None,
            quality: self.tests.clone(),
            history: self.history.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(target: u32) -> ProductionOrder {
        ProductionOrder::new(
            OrderId::from("PO_1"),
            LineId::from("C1"),
            target,
            vec!["steel-casing".into()],
            1,
            Utc::now(),
        )
    }

    fn advance(order: &mut ProductionOrder, to: OrderState) {
        let step = order.transition(to).unwrap();
        order.apply(&step);
    }

    #[test]
    fn steps_advance_the_sequence_only_when_applied() {
        let mut order = order(10);
        let created = order.created_step();
        assert_eq!(order.next_event(&created).event_id(), "PO_1:1");
        // a failed append leaves the id unchanged for the retry
        assert_eq!(order.next_event(&created).event_id(), "PO_1:1");
        order.apply(&created);
        let queued = order.transition(OrderState::Queued).unwrap();
        assert_eq!(order.next_event(&queued).event_id(), "PO_1:2");
        order.apply(&queued);
        assert_eq!(order.reserved_units(), 10);
    }

    #[test]
    fn illegal_edges_are_rejected() {
        let mut order = order(10);
        let err = order.transition(OrderState::InProgress).unwrap_err();
        assert_eq!(
            err,
            MesError::InvalidTransition {
                order_id: "PO_1".into(),
                from: "CREATED".into(),
                attempted: "IN_PROGRESS".into(),
            }
        );
        advance(&mut order, OrderState::Queued);
        advance(&mut order, OrderState::InProgress);
        assert!(order.transition(OrderState::Cancelled).is_err());
        assert!(order.verdict_step(Verdict::Pass, IndexMap::new()).is_err());
    }

    #[test]
    fn rework_rebuilds_the_sampled_unit_without_drawing_material() {
        let mut order = order(5);
        advance(&mut order, OrderState::Queued);
        advance(&mut order, OrderState::InProgress);
        for _ in 0..5 {
            let unit = order.unit_step().unwrap();
            order.apply(&unit);
        }
        assert!(order.unit_step().is_none());
        assert_eq!(order.reserved_units(), 0);

        advance(&mut order, OrderState::QualityCheck);
        assert_eq!(order.pending_test().unwrap().unit_sequence, 5);
        let verdict = order.verdict_step(Verdict::Fail, IndexMap::new()).unwrap();
        order.apply(&verdict);
        advance(&mut order, OrderState::Rework);
        assert_eq!(order.rework_count(), 1);
        advance(&mut order, OrderState::InProgress);
        assert_eq!(order.produced(), 4);

        let Some(Step::Unit(unit)) = order.unit_step() else {
            panic!("expected a unit step");
        };
        assert_eq!(unit.produced, 5);
        assert!(!unit.consumed);
        assert_eq!(
            order.history(),
            &[
                OrderState::Created,
                OrderState::Queued,
                OrderState::InProgress,
                OrderState::QualityCheck,
                OrderState::Rework,
                OrderState::InProgress,
            ]
        );
    }

    #[test]
    fn faults_block_unit_counting_until_resumed() {
        let mut order = order(5);
        advance(&mut order, OrderState::Queued);
        advance(&mut order, OrderState::InProgress);
        assert!(order.is_active());
        let fault = order.fault_step(FaultReason::LineFault);
        order.apply(&fault);
        assert!(!order.is_active());
        assert_eq!(order.state(), OrderState::InProgress);
        let resume = order.resume_step();
        order.apply(&resume);
        assert!(order.is_active());
    }
}
