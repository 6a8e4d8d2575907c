//! ---
//! mes_section: "01-core-functionality"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Per-line worker driving order state machines from field signals."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
//! One worker task per conveyor line.
//!
//! The worker owns every order assigned to its line and is the only writer of
//! their state. Field signals and planning commands reach it through a single
//! bounded queue, so everything that happens on a line is serialised. Signal
//! delivery never blocks the bridge: when the queue is full the newest value
//! per signal is parked in an overflow slot and picked up on the next cycle.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use r_mes_common::{
    AlarmCondition, FaultReason, LineConfig, LineId, MesError, MesResult, OperatingMode,
    OrderId, OrderState, SignalEvent, Verdict,
};
use r_mes_metrics::ProductionMetrics;
use r_mes_persistence::{
    DomainEvent, LineSpeedChanged, MeasurementRecorded, NewEvent, PersistenceSink, ReadModel,
};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alarms::AlarmManager;
use crate::assignment::LineAssignments;
use crate::inventory::{Inventory, InventoryChange};
use crate::journal::EventJournal;
use crate::order::{OrderSnapshot, ProductionOrder, Step};
use crate::quality::QualityEvaluator;

const FINISHED_RETAINED: usize = 256;
const PASS_RATE_WINDOW: usize = 100;

/// Shared services every line worker uses.
#[derive(Clone)]
pub struct LineContext {
    pub sink: PersistenceSink,
    pub journal: EventJournal,
    pub inventory: Arc<Inventory>,
    pub assignments: Arc<LineAssignments>,
    pub evaluator: Arc<QualityEvaluator>,
    pub alarms: AlarmManager,
    pub metrics: Option<ProductionMetrics>,
    pub verdict_timeout: Duration,
    pub cycle_interval: Duration,
    pub queue_capacity: usize,
}

enum LineCommand {
    Create {
        order: ProductionOrder,
        reply: oneshot::Sender<MesResult<OrderId>>,
    },
    Cancel {
        order_id: OrderId,
        reply: oneshot::Sender<MesResult<OrderSnapshot>>,
    },
    Resume {
        reply: oneshot::Sender<MesResult<Vec<OrderId>>>,
    },
    RecordSpeed {
        setpoint: f64,
        reply: oneshot::Sender<MesResult<()>>,
    },
    Order {
        order_id: OrderId,
        reply: oneshot::Sender<Option<OrderSnapshot>>,
    },
    Status {
        reply: oneshot::Sender<LineStatus>,
    },
}

enum LineInput {
    Signal { arrival: u64, event: SignalEvent },
    Command(LineCommand),
}

type Overflow = Arc<Mutex<IndexMap<String, (u64, SignalEvent)>>>;

/// Point-in-time view of a line.
#[derive(Debug, Clone, Serialize)]
pub struct LineStatus {
    pub line: LineId,
    pub mode: OperatingMode,
    pub assigned_order: Option<OrderId>,
    /// Orders still open on this line, in creation order.
    pub orders: Vec<OrderSnapshot>,
    /// Order counts by state, finished orders included.
    pub orders_by_state: BTreeMap<String, usize>,
    pub speed: Option<f64>,
    pub speed_setpoint: Option<f64>,
    pub vibration: Option<f64>,
    pub units_completed: u64,
    /// Verdicts in the pass-rate window.
    pub verdicts: usize,
    /// Fraction of passed verdicts in the window.
    pub pass_rate: Option<f64>,
    /// Time spent in `FAULT`, while faulted.
    pub fault_duration: Option<Duration>,
    /// Time since the last unit while running an in-progress order.
    pub idle_duration: Option<Duration>,
    pub deferred_orders: usize,
}

/// Cloneable sender side of a line worker.
#[derive(Clone)]
pub struct LineHandle {
    line: LineId,
    tx: mpsc::Sender<LineInput>,
    overflow: Overflow,
    arrivals: Arc<AtomicU64>,
    metrics: Option<ProductionMetrics>,
}

impl std::fmt::Debug for LineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineHandle")
            .field("line", &self.line)
            .finish_non_exhaustive()
    }
}

impl LineHandle {
    pub fn line(&self) -> &LineId {
        &self.line
    }

    /// Hand a signal event to the worker without blocking.
    pub fn offer(&self, event: &SignalEvent) {
        let arrival = self.arrivals.fetch_add(1, Ordering::SeqCst) + 1;
        let input = LineInput::Signal {
            arrival,
            event: event.clone(),
        };
        match self.tx.try_send(input) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.overflow
                    .lock()
                    .insert(event.signal.clone(), (arrival, event.clone()));
                if let Some(metrics) = &self.metrics {
                    metrics.record_coalesced(self.line.as_str());
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(line = %self.line, signal = %event.signal, "line worker stopped; signal dropped");
            }
        }
    }

    pub async fn create(&self, order: ProductionOrder) -> MesResult<OrderId> {
        self.request(|reply| LineCommand::Create { order, reply })
            .await?
    }

    pub async fn cancel(&self, order_id: OrderId) -> MesResult<OrderSnapshot> {
        self.request(|reply| LineCommand::Cancel { order_id, reply })
            .await?
    }

    /// Clear the FAULTED overlay of every order on the line.
    pub async fn resume(&self) -> MesResult<Vec<OrderId>> {
        self.request(|reply| LineCommand::Resume { reply }).await?
    }

    pub async fn record_speed(&self, setpoint: f64) -> MesResult<()> {
        self.request(|reply| LineCommand::RecordSpeed { setpoint, reply })
            .await?
    }

    pub async fn order(&self, order_id: OrderId) -> MesResult<Option<OrderSnapshot>> {
        self.request(|reply| LineCommand::Order { order_id, reply })
            .await
    }

    pub async fn status(&self) -> MesResult<LineStatus> {
        self.request(|reply| LineCommand::Status { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> LineCommand,
    ) -> MesResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LineInput::Command(build(reply)))
            .await
            .map_err(|_| MesError::ShuttingDown)?;
        rx.await.map_err(|_| MesError::ShuttingDown)
    }
}

/// Owner of one line's orders and signal-derived state.
pub struct LineWorker {
    line: LineId,
    config: LineConfig,
    ctx: LineContext,
    rx: mpsc::Receiver<LineInput>,
    overflow: Overflow,
    mode: OperatingMode,
    mode_since: Instant,
    running: Option<bool>,
    fault: Option<bool>,
    counter: Option<i64>,
    credited: Option<i64>,
    last_progress: Instant,
    speed: Option<f64>,
    speed_setpoint: Option<f64>,
    vibration: Option<f64>,
    measurements: IndexMap<String, Option<(f64, u64)>>,
    measurement_sequences: HashMap<String, u64>,
    speed_sequence: u64,
    last_arrival: HashMap<String, u64>,
    latest_arrival: u64,
    orders: IndexMap<OrderId, ProductionOrder>,
    finished: VecDeque<OrderSnapshot>,
    finished_counts: BTreeMap<&'static str, usize>,
    recent_verdicts: VecDeque<Verdict>,
    units_total: u64,
    /// Reason each blocked `CREATED` order cannot be queued.
    blocked: HashMap<OrderId, String>,
    persistence_alarms: HashSet<OrderId>,
}

impl LineWorker {
    /// Build the worker for `line`, restoring its orders from `model`.
    pub fn new(
        line: LineId,
        config: LineConfig,
        ctx: LineContext,
        model: &ReadModel,
    ) -> (Self, LineHandle) {
        let (tx, rx) = mpsc::channel(ctx.queue_capacity.max(1));
        let overflow: Overflow = Arc::new(Mutex::new(IndexMap::new()));
        let handle = LineHandle {
            line: line.clone(),
            tx,
            overflow: Arc::clone(&overflow),
            arrivals: Arc::new(AtomicU64::new(0)),
            metrics: ctx.metrics.clone(),
        };

        let measurements = config
            .measurements
            .iter()
            .map(|signal| (signal.clone(), None))
            .collect();
        let measurement_sequences = config
            .measurements
            .iter()
            .map(|signal| {
                (
                    signal.clone(),
                    model.next_sequence(&format!("signal/{signal}")),
                )
            })
            .collect();
        let view = model.line(&line);
        let now = Instant::now();

        let mut worker = Self {
            speed_sequence: model.next_sequence(&format!("line/{line}")),
            units_total: view.map(|view| view.units_completed).unwrap_or(0),
            speed_setpoint: view.and_then(|view| view.speed_setpoint),
            line,
            config,
            ctx,
            rx,
            overflow,
            mode: OperatingMode::Stop,
            mode_since: now,
            running: None,
            fault: None,
            counter: None,
            credited: None,
            last_progress: now,
            speed: None,
            vibration: None,
            measurements,
            measurement_sequences,
            last_arrival: HashMap::new(),
            latest_arrival: 0,
            orders: IndexMap::new(),
            finished: VecDeque::new(),
            finished_counts: BTreeMap::new(),
            recent_verdicts: VecDeque::new(),
            blocked: HashMap::new(),
            persistence_alarms: HashSet::new(),
        };
        let line = worker.line.clone();
        for view in model.orders().filter(|view| view.line == line) {
            let order = ProductionOrder::restore(view, model.next_sequence(view.order_id.as_str()));
            worker.restore(order);
        }
        (worker, handle)
    }

    fn restore(&mut self, mut order: ProductionOrder) {
        let state = order.state();
        if state.is_terminal() {
            self.remember(order.snapshot());
            return;
        }
        if matches!(
            state,
            OrderState::InProgress | OrderState::QualityCheck | OrderState::Rework
        ) {
            match self.ctx.assignments.try_assign(&self.line, &order.id) {
                Ok(true) => {}
                Ok(false) => {
                    error!(line = %self.line, order_id = %order.id, "restored order conflicts with the line holder")
                }
                Err(err) => warn!(order_id = %order.id, error = %err, "cannot restore line claim"),
            }
        }
        if state == OrderState::QualityCheck && order.faulted().is_none() {
            order.arm_verdict(Instant::now() + self.ctx.verdict_timeout, 0);
        }
        debug!(line = %self.line, order_id = %order.id, state = %state, produced = order.produced(), "order restored");
        self.orders.insert(order.id.clone(), order);
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.ctx.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(line = %self.line, orders = self.orders.len(), "line worker started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                input = self.rx.recv() => match input {
                    Some(LineInput::Signal { arrival, event }) => {
                        self.on_signal(arrival, event).await;
                        self.settle().await;
                    }
                    Some(LineInput::Command(command)) => {
                        self.on_command(command).await;
                        self.settle().await;
                    }
                    None => break,
                },
                _ = ticker.tick() => self.on_cycle().await,
            }
        }
        info!(line = %self.line, open_orders = self.orders.len(), "line worker stopped");
    }

    async fn on_cycle(&mut self) {
        let parked = {
            let mut overflow = self.overflow.lock();
            let mut parked: Vec<(u64, SignalEvent)> = overflow.drain(..).map(|(_, slot)| slot).collect();
            parked.sort_by_key(|(arrival, _)| *arrival);
            parked
        };
        for (arrival, event) in parked {
            self.on_signal(arrival, event).await;
        }
        self.retry_deferred().await;
        if self.mode == OperatingMode::Fault {
            self.fault_orders().await;
        }
        self.expire_verdicts().await;
        self.settle().await;
    }

    async fn settle(&mut self) {
        self.evaluate_pending().await;
        self.schedule().await;
        self.credit_units().await;
    }

    async fn on_command(&mut self, command: LineCommand) {
        match command {
            LineCommand::Create { order, reply } => {
                let _ = reply.send(self.create(order).await);
            }
            LineCommand::Cancel { order_id, reply } => {
                let _ = reply.send(self.cancel(&order_id).await);
            }
            LineCommand::Resume { reply } => {
                let _ = reply.send(self.resume().await);
            }
            LineCommand::RecordSpeed { setpoint, reply } => {
                let _ = reply.send(self.record_speed(setpoint).await);
            }
            LineCommand::Order { order_id, reply } => {
                let _ = reply.send(self.snapshot(&order_id));
            }
            LineCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    async fn on_signal(&mut self, arrival: u64, event: SignalEvent) {
        let last = self.last_arrival.entry(event.signal.clone()).or_insert(0);
        if arrival <= *last {
            debug!(line = %self.line, signal = %event.signal, "superseded signal update ignored");
            return;
        }
        *last = arrival;
        self.latest_arrival = self.latest_arrival.max(arrival);

        let name = event.signal.as_str();
        let value = event.good_value();
        if name == self.config.running {
            if let Some(running) = value.and_then(|value| value.as_bool()) {
                self.running = Some(running);
                self.update_mode().await;
            }
        } else if name == self.config.fault {
            if let Some(fault) = value.and_then(|value| value.as_bool()) {
                self.fault = Some(fault);
                self.update_mode().await;
            }
        } else if name == self.config.unit_count {
            if let Some(count) = value.and_then(|value| value.as_i64()) {
                self.on_counter(count);
            }
        } else if Some(name) == self.config.speed.as_deref() {
            self.speed = value.and_then(|value| value.as_f64());
        } else if Some(name) == self.config.speed_setpoint.as_deref() {
            if let Some(setpoint) = value.and_then(|value| value.as_f64()) {
                self.speed_setpoint = Some(setpoint);
            }
        } else if Some(name) == self.config.vibration.as_deref() {
            self.vibration = value.and_then(|value| value.as_f64());
        } else if self.measurements.contains_key(name) {
            let reading = value
                .and_then(|value| value.as_f64())
                .map(|value| (value, arrival));
            self.measurements.insert(event.signal.clone(), reading);
            self.record_measurement(&event).await;
        }
    }

    async fn update_mode(&mut self) {
        let mode = OperatingMode::derive(
            self.running.unwrap_or(false),
            self.fault.unwrap_or(false),
        );
        if mode == self.mode {
            return;
        }
        info!(line = %self.line, from = %self.mode, to = %mode, "line mode changed");
        self.mode = mode;
        self.mode_since = Instant::now();
        match mode {
            OperatingMode::Fault => self.fault_orders().await,
            OperatingMode::Run => self.last_progress = Instant::now(),
            OperatingMode::Stop => {}
        }
    }

    fn on_counter(&mut self, count: i64) {
        match self.counter {
            None => {
                self.counter = Some(count);
                if self.credited.is_none() {
                    self.credited = Some(count);
                }
            }
            Some(previous) if count < previous => {
                warn!(line = %self.line, previous, count, "unit counter went backwards; rebasing");
                self.counter = Some(count);
                self.credited = Some(count);
            }
            Some(previous) => {
                if count > previous {
                    self.last_progress = Instant::now();
                }
                self.counter = Some(count);
            }
        }
    }

    async fn record_measurement(&mut self, event: &SignalEvent) {
        let sequence = *self
            .measurement_sequences
            .entry(event.signal.clone())
            .or_insert(1);
        let recorded = NewEvent::new(
            sequence,
            DomainEvent::MeasurementRecorded(MeasurementRecorded {
                signal: event.signal.clone(),
                line: Some(self.line.clone()),
                value: event.value,
                quality: event.quality,
            }),
        );
        match self.ctx.sink.append(recorded).await {
            Ok(_) => {
                self.measurement_sequences
                    .insert(event.signal.clone(), sequence + 1);
            }
            Err(err) => {
                debug!(line = %self.line, signal = %event.signal, error = %err, "measurement not recorded")
            }
        }
    }

    async fn create(&mut self, mut order: ProductionOrder) -> MesResult<OrderId> {
        if order.line != self.line {
            return Err(MesError::InvalidLine(order.line.to_string()));
        }
        if self.orders.contains_key(&order.id) || self.finished.iter().any(|done| done.order_id == order.id) {
            return Err(MesError::InvalidRequest(format!(
                "order {} already exists",
                order.id
            )));
        }
        let step = order.created_step();
        self.ctx.sink.append(order.next_event(&step)).await?;
        order.apply(&step);
        info!(
            line = %self.line,
            order_id = %order.id,
            target_quantity = order.target_quantity,
            priority = order.priority,
            "order created"
        );
        self.record_transition(OrderState::Created);
        let order_id = order.id.clone();
        self.orders.insert(order_id.clone(), order);
        Ok(order_id)
    }

    async fn cancel(&mut self, order_id: &OrderId) -> MesResult<OrderSnapshot> {
        let Some(order) = self.orders.get(order_id) else {
            return match self.finished.iter().find(|done| &done.order_id == order_id) {
                Some(done) => Err(MesError::InvalidTransition {
                    order_id: order_id.to_string(),
                    from: done.state.to_string(),
                    attempted: OrderState::Cancelled.to_string(),
                }),
                None => Err(MesError::UnknownOrder(order_id.to_string())),
            };
        };
        if order.is_deferred() {
            return Err(MesError::Persistence(format!(
                "order {order_id} is waiting for the event log"
            )));
        }
        let step = order.transition(OrderState::Cancelled)?;
        self.drive(order_id, step).await?;
        self.snapshot(order_id)
            .ok_or_else(|| MesError::UnknownOrder(order_id.to_string()))
    }

    async fn resume(&mut self) -> MesResult<Vec<OrderId>> {
        if self.mode == OperatingMode::Fault {
            return Err(MesError::InvalidTransition {
                order_id: self.line.to_string(),
                from: OperatingMode::Fault.to_string(),
                attempted: "resume".into(),
            });
        }
        let faulted: Vec<OrderId> = self
            .orders
            .values()
            .filter(|order| order.faulted().is_some() && !order.is_deferred())
            .map(|order| order.id.clone())
            .collect();
        let mut resumed = Vec::with_capacity(faulted.len());
        for order_id in faulted {
            let Some(step) = self.orders.get(&order_id).map(|order| order.resume_step()) else {
                continue;
            };
            self.drive(&order_id, step).await?;
            resumed.push(order_id);
        }
        if !resumed.is_empty() {
            info!(line = %self.line, orders = resumed.len(), "faulted orders resumed");
        }
        Ok(resumed)
    }

    async fn record_speed(&mut self, setpoint: f64) -> MesResult<()> {
        let event = NewEvent::new(
            self.speed_sequence,
            DomainEvent::LineSpeedChanged(LineSpeedChanged {
                line: self.line.clone(),
                setpoint,
            }),
        );
        self.ctx.sink.append(event).await?;
        self.speed_sequence += 1;
        self.speed_setpoint = Some(setpoint);
        Ok(())
    }

    /// Commit `step` and every step it implies.
    async fn drive(&mut self, order_id: &OrderId, step: Step) -> MesResult<()> {
        let mut next = Some(step);
        while let Some(step) = next.take() {
            self.commit(order_id, &step).await?;
            next = self.follow_up(order_id, &step).await;
        }
        Ok(())
    }

    /// Append `step` and apply it once durable. A refused append parks the
    /// step on the order, which halts it until the step is retried.
    async fn commit(&mut self, order_id: &OrderId, step: &Step) -> MesResult<()> {
        let Some(order) = self.orders.get(order_id) else {
            return Err(MesError::UnknownOrder(order_id.to_string()));
        };
        let event = order.next_event(step);
        let event_id = event.event_id();
        let result = self.ctx.sink.append(event).await;
        let Some(order) = self.orders.get_mut(order_id) else {
            return Err(MesError::UnknownOrder(order_id.to_string()));
        };
        match result {
            Ok(_) => {
                order.take_deferred();
                order.apply(step);
                if let Step::Transition(transition) = step {
                    info!(
                        line = %self.line,
                        order_id = %order_id,
                        from = %transition.from,
                        to = %transition.to,
                        produced = transition.produced,
                        rework_count = transition.rework_count,
                        "order transitioned"
                    );
                    self.record_transition(transition.to);
                }
                if self.persistence_alarms.remove(order_id) {
                    info!(line = %self.line, order_id = %order_id, event_id = %event_id, "halted order resumed after event log recovery");
                    self.ctx
                        .alarms
                        .clear(&AlarmCondition::PersistenceFailure {
                            order_id: order_id.clone(),
                        })
                        .await;
                }
                Ok(())
            }
            Err(err) => {
                order.defer(step.clone());
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.record_halt(self.line.as_str());
                }
                if self.persistence_alarms.insert(order_id.clone()) {
                    error!(line = %self.line, order_id = %order_id, event_id = %event_id, step = step.label(), error = %err, "order halted; step not durable");
                    self.ctx
                        .alarms
                        .raise(
                            AlarmCondition::PersistenceFailure {
                                order_id: order_id.clone(),
                            },
                            format!("order {order_id} halted: {err}"),
                        )
                        .await;
                }
                Err(err.into())
            }
        }
    }

    /// Consequences of a committed step; returns the step it implies, if any.
    async fn follow_up(&mut self, order_id: &OrderId, step: &Step) -> Option<Step> {
        match step {
            Step::Unit(unit) => {
                self.units_total += 1;
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.record_unit(self.line.as_str());
                }
                let order = self.orders.get(order_id)?;
                if unit.consumed {
                    let consumed = self.ctx.inventory.consume(&order.id, &order.materials, 1);
                    self.journal(consumed);
                }
                debug!(line = %self.line, order_id = %order_id, produced = unit.produced, "unit completed");
                self.ctx
                    .evaluator
                    .is_checkpoint(&self.line, unit.produced, order.target_quantity)
                    .then(|| order.transition(OrderState::QualityCheck).ok())
                    .flatten()
            }
            Step::Transition(transition) => match transition.to {
                OrderState::QualityCheck => {
                    let deadline = Instant::now() + self.ctx.verdict_timeout;
                    let mark = self.latest_arrival;
                    self.orders.get_mut(order_id)?.arm_verdict(deadline, mark);
                    None
                }
                OrderState::Rework => self
                    .orders
                    .get(order_id)?
                    .transition(OrderState::InProgress)
                    .ok(),
                OrderState::InProgress => {
                    self.last_progress = Instant::now();
                    None
                }
                state if state.is_terminal() => {
                    self.finish(order_id).await;
                    None
                }
                _ => None,
            },
            Step::Verdict(recorded) => {
                self.recent_verdicts.push_back(recorded.verdict);
                while self.recent_verdicts.len() > PASS_RATE_WINDOW {
                    self.recent_verdicts.pop_front();
                }
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.record_verdict(self.line.as_str(), recorded.verdict.as_str());
                }
                self.ctx
                    .alarms
                    .clear(&AlarmCondition::VerdictTimeout {
                        order_id: order_id.clone(),
                    })
                    .await;
                let order = self.orders.get(order_id)?;
                let next = match recorded.verdict {
                    Verdict::Pass if order.produced() >= order.target_quantity => {
                        OrderState::Completed
                    }
                    Verdict::Pass => OrderState::InProgress,
                    Verdict::Fail => self.ctx.evaluator.resolve_fail(order.rework_count()),
                    Verdict::Pending => return None,
                };
                order.transition(next).ok()
            }
            Step::Resume(_) => {
                let deadline = Instant::now() + self.ctx.verdict_timeout;
                self.orders.get_mut(order_id)?.rearm_verdict(deadline);
                self.ctx
                    .alarms
                    .clear(&AlarmCondition::VerdictTimeout {
                        order_id: order_id.clone(),
                    })
                    .await;
                None
            }
            Step::Created(_) | Step::Fault(_) => None,
        }
    }

    async fn finish(&mut self, order_id: &OrderId) {
        let Some(mut order) = self.orders.shift_remove(order_id) else {
            return;
        };
        self.ctx.assignments.release(&self.line, order_id);
        let remaining = order.settle_reservation();
        if remaining > 0 {
            let released = self
                .ctx
                .inventory
                .release(order_id, &order.materials, remaining);
            self.journal(released);
        }
        // units counted past the end of an order belong to nobody
        self.credited = self.counter;
        self.blocked.remove(order_id);
        self.ctx
            .alarms
            .clear(&AlarmCondition::VerdictTimeout {
                order_id: order_id.clone(),
            })
            .await;
        info!(
            line = %self.line,
            order_id = %order_id,
            state = %order.state(),
            produced = order.produced(),
            rework_count = order.rework_count(),
            "order finished"
        );
        self.remember(order.snapshot());
    }

    fn remember(&mut self, snapshot: OrderSnapshot) {
        *self.finished_counts.entry(snapshot.state.as_str()).or_default() += 1;
        self.finished.push_back(snapshot);
        while self.finished.len() > FINISHED_RETAINED {
            self.finished.pop_front();
        }
    }

    async fn retry_deferred(&mut self) {
        let deferred: Vec<(OrderId, Step)> = self
            .orders
            .values()
            .filter_map(|order| {
                order
                    .deferred_step()
                    .map(|step| (order.id.clone(), step.clone()))
            })
            .collect();
        for (order_id, step) in deferred {
            if self.drive(&order_id, step).await.is_err() {
                // the sink is still refusing; later orders would fail the same way
                break;
            }
        }
    }

    async fn evaluate_pending(&mut self) {
        let awaiting: Vec<OrderId> = self
            .orders
            .values()
            .filter(|order| {
                order.state() == OrderState::QualityCheck
                    && order.faulted().is_none()
                    && !order.is_deferred()
                    && order.pending_test().is_some_and(|test| !test.is_decided())
            })
            .map(|order| order.id.clone())
            .collect();
        for order_id in awaiting {
            let Some(order) = self.orders.get(&order_id) else {
                continue;
            };
            let mark = order.sample_mark();
            let readings: IndexMap<String, Option<f64>> = self
                .measurements
                .iter()
                .map(|(signal, reading)| {
                    let fresh = reading
                        .filter(|(_, arrival)| *arrival > mark)
                        .map(|(value, _)| value);
                    (signal.clone(), fresh)
                })
                .collect();
            let verdict = self.ctx.evaluator.evaluate(&readings);
            if verdict == Verdict::Pending {
                continue;
            }
            let measurements: IndexMap<String, f64> = readings
                .into_iter()
                .filter_map(|(signal, value)| value.map(|value| (signal, value)))
                .collect();
            let step = match order.verdict_step(verdict, measurements) {
                Ok(step) => step,
                Err(err) => {
                    debug!(order_id = %order_id, error = %err, "verdict not applicable");
                    continue;
                }
            };
            info!(
                line = %self.line,
                order_id = %order_id,
                unit = order.pending_test().map(|test| test.unit_sequence),
                verdict = %verdict,
                "quality verdict"
            );
            if let Err(err) = self.drive(&order_id, step).await {
                debug!(order_id = %order_id, error = %err, "verdict waiting for the event log");
            }
        }
    }

    /// Order occupying the line, including one whose queueing is not durable yet.
    fn occupant(&self) -> Option<&ProductionOrder> {
        self.orders
            .values()
            .find(|order| order.state().holds_line() || order.is_deferred())
    }

    async fn schedule(&mut self) {
        if self.occupant().is_none() {
            let mut candidates: Vec<(u32, usize, OrderId)> = self
                .orders
                .values()
                .enumerate()
                .filter(|(_, order)| {
                    order.state() == OrderState::Created && order.faulted().is_none()
                })
                .map(|(position, order)| (order.priority, position, order.id.clone()))
                .collect();
            candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            for (_, _, order_id) in candidates {
                if self.promote(&order_id).await {
                    break;
                }
            }
        }

        if self.mode != OperatingMode::Run {
            return;
        }
        let queued = self
            .orders
            .values()
            .find(|order| {
                order.state() == OrderState::Queued
                    && order.faulted().is_none()
                    && !order.is_deferred()
            })
            .map(|order| order.id.clone());
        if let Some(order_id) = queued {
            self.start(&order_id).await;
        }
    }

    /// Reserve material and queue the order. Returns whether the line is now taken.
    async fn promote(&mut self, order_id: &OrderId) -> bool {
        let Some(order) = self.orders.get(order_id) else {
            return false;
        };
        let step = match order.transition(OrderState::Queued) {
            Ok(step) => step,
            Err(err) => {
                debug!(order_id = %order_id, error = %err, "order cannot be queued");
                return false;
            }
        };
        match self
            .ctx
            .inventory
            .reserve(order_id, &order.materials, order.target_quantity)
        {
            Ok(changes) => {
                self.blocked.remove(order_id);
                self.journal(Ok(changes));
            }
            Err(err) => {
                let reason = err.to_string();
                if self.blocked.get(order_id) != Some(&reason) {
                    warn!(line = %self.line, order_id = %order_id, error = %err, "order blocked on material");
                    self.blocked.insert(order_id.clone(), reason);
                }
                return false;
            }
        }
        if let Err(err) = self.drive(order_id, step).await {
            debug!(order_id = %order_id, error = %err, "queueing waits for the event log");
        }
        true
    }

    async fn start(&mut self, order_id: &OrderId) {
        match self.ctx.assignments.try_assign(&self.line, order_id) {
            Ok(true) => {}
            Ok(false) => {
                debug!(line = %self.line, order_id = %order_id, "line held by another order");
                return;
            }
            Err(err) => {
                warn!(line = %self.line, order_id = %order_id, error = %err, "line claim failed");
                return;
            }
        }
        let Some(step) = self
            .orders
            .get(order_id)
            .and_then(|order| order.transition(OrderState::InProgress).ok())
        else {
            return;
        };
        if let Err(err) = self.drive(order_id, step).await {
            debug!(order_id = %order_id, error = %err, "start waits for the event log");
        }
    }

    /// Attribute counted units to the order in production, one at a time.
    async fn credit_units(&mut self) {
        loop {
            let (Some(counter), Some(credited)) = (self.counter, self.credited) else {
                return;
            };
            if counter <= credited {
                return;
            }
            let producing = self
                .orders
                .values()
                .find(|order| {
                    matches!(
                        order.state(),
                        OrderState::InProgress | OrderState::QualityCheck | OrderState::Rework
                    )
                })
                .map(|order| (order.id.clone(), order.is_active(), order.unit_step()));
            let Some((order_id, active, step)) = producing else {
                debug!(line = %self.line, discarded = counter - credited, "units counted without an order in production");
                self.credited = Some(counter);
                return;
            };
            if !active {
                return;
            }
            let Some(step) = step else {
                self.credited = Some(counter);
                return;
            };
            self.credited = Some(credited + 1);
            if self.drive(&order_id, step).await.is_err() {
                return;
            }
        }
    }

    async fn expire_verdicts(&mut self) {
        let now = Instant::now();
        let expired: Vec<OrderId> = self
            .orders
            .values()
            .filter(|order| {
                order.state() == OrderState::QualityCheck
                    && order.faulted().is_none()
                    && !order.is_deferred()
                    && order.verdict_deadline().is_some_and(|deadline| deadline <= now)
            })
            .map(|order| order.id.clone())
            .collect();
        for order_id in expired {
            let Some(step) = self
                .orders
                .get(&order_id)
                .map(|order| order.fault_step(FaultReason::VerdictTimeout))
            else {
                continue;
            };
            warn!(line = %self.line, order_id = %order_id, "quality verdict timed out");
            if self.drive(&order_id, step).await.is_ok() {
                self.ctx
                    .alarms
                    .raise(
                        AlarmCondition::VerdictTimeout {
                            order_id: order_id.clone(),
                        },
                        format!(
                            "no verdict for order {order_id} within {}s",
                            self.ctx.verdict_timeout.as_secs()
                        ),
                    )
                    .await;
            }
        }
    }

    async fn fault_orders(&mut self) {
        let affected: Vec<OrderId> = self
            .orders
            .values()
            .filter(|order| order.faulted().is_none() && !order.is_deferred())
            .map(|order| order.id.clone())
            .collect();
        for order_id in affected {
            let Some(step) = self
                .orders
                .get(&order_id)
                .map(|order| order.fault_step(FaultReason::LineFault))
            else {
                continue;
            };
            warn!(line = %self.line, order_id = %order_id, "order faulted by line fault");
            if self.drive(&order_id, step).await.is_err() {
                break;
            }
        }
    }

    fn journal(&self, changes: MesResult<Vec<InventoryChange>>) {
        match changes {
            Ok(changes) => self
                .ctx
                .journal
                .record_all(changes.iter().map(InventoryChange::to_event)),
            Err(err) => warn!(line = %self.line, error = %err, "inventory adjustment failed"),
        }
    }

    fn record_transition(&self, state: OrderState) {
        if let Some(metrics) = &self.ctx.metrics {
            metrics.record_transition(self.line.as_str(), state.as_str());
        }
    }

    fn view(&self, order: &ProductionOrder) -> OrderSnapshot {
        let mut snapshot = order.snapshot();
        snapshot.blocked = self.blocked.get(&order.id).cloned();
        snapshot
    }

    fn snapshot(&self, order_id: &OrderId) -> Option<OrderSnapshot> {
        self.orders
            .get(order_id)
            .map(|order| self.view(order))
            .or_else(|| {
                self.finished
                    .iter()
                    .rev()
                    .find(|done| &done.order_id == order_id)
                    .cloned()
            })
    }

    fn status(&self) -> LineStatus {
        let now = Instant::now();
        let mut orders_by_state: BTreeMap<String, usize> = self
            .finished_counts
            .iter()
            .map(|(state, count)| ((*state).to_owned(), *count))
            .collect();
        for order in self.orders.values() {
            *orders_by_state
                .entry(order.state().as_str().to_owned())
                .or_default() += 1;
        }
        let passed = self
            .recent_verdicts
            .iter()
            .filter(|verdict| **verdict == Verdict::Pass)
            .count();
        let producing = self.orders.values().any(|order| {
            order.state() == OrderState::InProgress && order.faulted().is_none()
        });
        LineStatus {
            line: self.line.clone(),
            mode: self.mode,
            assigned_order: self.ctx.assignments.holder(&self.line),
            orders: self.orders.values().map(|order| self.view(order)).collect(),
            orders_by_state,
            speed: self.speed,
            speed_setpoint: self.speed_setpoint,
            vibration: self.vibration,
            units_completed: self.units_total,
            verdicts: self.recent_verdicts.len(),
            pass_rate: (!self.recent_verdicts.is_empty())
                .then(|| passed as f64 / self.recent_verdicts.len() as f64),
            fault_duration: (self.mode == OperatingMode::Fault)
                .then(|| now.duration_since(self.mode_since)),
            idle_duration: (self.mode == OperatingMode::Run && producing)
                .then(|| now.duration_since(self.last_progress)),
            deferred_orders: self.orders.values().filter(|order| order.is_deferred()).count(),
        }
    }
}
