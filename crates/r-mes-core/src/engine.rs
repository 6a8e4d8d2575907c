//! ---
//! mes_section: "01-core-functionality"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Engine assembly and the planning interface."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use r_mes_common::{
    line_span, Alarm, AlarmCondition, AppConfig, DataKind, InventoryItem, LineId, MesError,
    MesResult, OrderId, SignalEvent, SignalValue,
};
use r_mes_metrics::ProductionMetrics;
use r_mes_net::{SignalCallback, SubscriptionBridge, SubscriptionId};
use r_mes_persistence::{EventRecord, OrderView, PersistenceSink, ReadModel};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

use crate::alarms::{AlarmManager, AlarmMonitor};
use crate::assignment::LineAssignments;
use crate::inventory::Inventory;
use crate::journal::EventJournal;
use crate::line::{LineContext, LineHandle, LineStatus, LineWorker};
use crate::order::{OrderSnapshot, ProductionOrder};
use crate::quality::QualityEvaluator;

/// Priority given to orders created without one.
pub const DEFAULT_PRIORITY: u32 = 1;
const PROJECTION_BATCH: usize = 512;

/// A production order as requested by the planning layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    pub line: LineId,
    pub target_quantity: u32,
    pub materials: Vec<String>,
    pub priority: u32,
}

impl OrderRequest {
    pub fn new<I, S>(line: LineId, target_quantity: u32, materials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            line,
            target_quantity,
            materials: materials.into_iter().map(Into::into).collect(),
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

/// Plant-wide summary.
#[derive(Debug, Clone, Serialize)]
pub struct ProductionStatus {
    pub generated_at: DateTime<Utc>,
    pub lines: Vec<LineStatus>,
    pub orders_by_state: BTreeMap<String, usize>,
    pub active_alarms: Vec<Alarm>,
    pub inventory: Vec<InventoryItem>,
    pub shedding: bool,
    pub write_latency_ms: u64,
}

/// The running production engine: one worker per line, the alarm monitor, the
/// stock journal and the read-model projector, behind the planning interface.
pub struct MesEngine {
    config: Arc<AppConfig>,
    bridge: SubscriptionBridge,
    sink: PersistenceSink,
    inventory: Arc<Inventory>,
    alarms: AlarmManager,
    journal: EventJournal,
    lines: IndexMap<LineId, LineHandle>,
    directory: Mutex<HashMap<OrderId, LineId>>,
    read_model: Arc<RwLock<ReadModel>>,
    ordinal: AtomicU64,
    subscriptions: Vec<SubscriptionId>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl MesEngine {
    /// Replay the event log, restore state and start every task.
    ///
    /// Line workers are subscribed before the bridge connects, so the resync
    /// performed on connect reaches them.
    pub async fn start(
        config: Arc<AppConfig>,
        bridge: SubscriptionBridge,
        sink: PersistenceSink,
        metrics: Option<ProductionMetrics>,
    ) -> MesResult<Self> {
        let mut model = ReadModel::new();
        let replayed = sink.catch_up(&mut model).await?;
        debug!(replayed, cursor = model.cursor(), "event log replayed");

        let inventory = Arc::new(Inventory::from_config(&config.inventory));
        for level in model.inventory_levels() {
            inventory.restore(level);
        }
        let alarms = AlarmManager::new(sink.clone(), metrics.clone());
        let active_alarms = alarms.restore(&model).await;

        let (shutdown, _) = broadcast::channel(1);
        let (journal, journal_task) = EventJournal::spawn(
            sink.clone(),
            config.scheduling.cycle_interval,
            shutdown.subscribe(),
        );
        let mut tasks = vec![journal_task];

        let ctx = LineContext {
            sink: sink.clone(),
            journal: journal.clone(),
            inventory: Arc::clone(&inventory),
            assignments: Arc::new(LineAssignments::new(config.line_ids())),
            evaluator: Arc::new(QualityEvaluator::from_config(&config)),
            alarms: alarms.clone(),
            metrics: metrics.clone(),
            verdict_timeout: config.quality.verdict_timeout,
            cycle_interval: config.scheduling.cycle_interval,
            queue_capacity: config.bridge.queue_capacity,
        };

        let mut workers = Vec::with_capacity(config.lines.len());
        let mut lines = IndexMap::new();
        let mut subscriptions = Vec::with_capacity(config.lines.len());
        for (id, line_config) in &config.lines {
            let line = LineId::new(id.as_str());
            let (worker, handle) =
                LineWorker::new(line.clone(), line_config.clone(), ctx.clone(), &model);
            let feed = handle.clone();
            let callback: SignalCallback = Arc::new(move |event: &SignalEvent| feed.offer(event));
            match bridge.subscribe(line_config.signals(), callback) {
                Ok(subscription) => subscriptions.push(subscription),
                Err(err) => {
                    for subscription in subscriptions {
                        bridge.unsubscribe(subscription);
                    }
                    let _ = shutdown.send(());
                    return Err(err);
                }
            }
            workers.push((line.clone(), worker));
            lines.insert(line, handle);
        }
        for (line, worker) in workers {
            let span = line_span(line.as_str());
            tasks.push(tokio::spawn(worker.run(shutdown.subscribe()).instrument(span)));
        }
        if let Some(metrics) = &metrics {
            metrics.set_line_count(lines.len());
        }

        let notices = bridge.notices();
        let monitor = AlarmMonitor::new(
            &config,
            alarms.clone(),
            bridge.clone(),
            lines.values().cloned().collect(),
            Arc::clone(&inventory),
            journal.clone(),
            sink.clone(),
            metrics,
        );
        tasks.push(tokio::spawn(monitor.run(notices, shutdown.subscribe())));

        let directory: HashMap<OrderId, LineId> = model
            .orders()
            .map(|view| (view.order_id.clone(), view.line.clone()))
            .collect();
        let known_orders = directory.len();
        let read_model = Arc::new(RwLock::new(model));
        tasks.push(tokio::spawn(project(
            sink.clone(),
            Arc::clone(&read_model),
            config.scheduling.cycle_interval,
            shutdown.subscribe(),
        )));

        let pending = bridge.connect_all().await;
        if !pending.is_empty() {
            warn!(endpoints = ?pending, "endpoints not reachable yet; retrying in background");
        }
        info!(
            site = %config.site,
            lines = lines.len(),
            orders = known_orders,
            active_alarms,
            replayed,
            "production engine started"
        );

        Ok(Self {
            config,
            bridge,
            sink,
            inventory,
            alarms,
            journal,
            lines,
            directory: Mutex::new(directory),
            read_model,
            ordinal: AtomicU64::new(known_orders as u64),
            subscriptions,
            shutdown,
            tasks,
        })
    }

    /// `createOrder(lineId, targetQty, materialRefs)` with the default priority.
    pub async fn create_order<I, S>(
        &self,
        line: LineId,
        target_quantity: u32,
        materials: I,
    ) -> MesResult<OrderId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submit(OrderRequest::new(line, target_quantity, materials))
            .await
    }

    /// Create an order on its line. The order is durable once this returns.
    pub async fn submit(&self, request: OrderRequest) -> MesResult<OrderId> {
        let handle = self.handle(&request.line)?;
        if request.target_quantity == 0 {
            return Err(MesError::InvalidRequest(
                "target quantity must be positive".into(),
            ));
        }
        let mut materials: Vec<String> = Vec::with_capacity(request.materials.len());
        for material in request.materials {
            if !self.inventory.contains(&material) {
                return Err(MesError::UnknownMaterial(material));
            }
            if !materials.contains(&material) {
                materials.push(material);
            }
        }
        let created_at = Utc::now();
        let ordinal = self.ordinal.fetch_add(1, Ordering::SeqCst) + 1;
        let order = ProductionOrder::new(
            OrderId::generate(created_at, ordinal),
            request.line.clone(),
            request.target_quantity,
            materials,
            request.priority,
            created_at,
        );
        let order_id = handle.create(order).await?;
        self.directory
            .lock()
            .insert(order_id.clone(), request.line);
        Ok(order_id)
    }

    /// `cancelOrder(orderId)`: only `CREATED` and `QUEUED` orders can be cancelled.
    pub async fn cancel_order(&self, order_id: &OrderId) -> MesResult<OrderSnapshot> {
        let line = self.line_of(order_id)?;
        self.handle(&line)?.cancel(order_id.clone()).await
    }

    /// `resumeFault(lineId)`: clear the FAULTED overlay once the line left `FAULT`.
    pub async fn resume_fault(&self, line: &LineId) -> MesResult<Vec<OrderId>> {
        self.handle(line)?.resume().await
    }

    /// Write a new speed setpoint to the line. Not retried; the alarm monitor
    /// raises `WriteRejected` from the bridge notice and clears it on the next
    /// accepted write.
    pub async fn set_line_speed(&self, line: &LineId, setpoint: f64) -> MesResult<()> {
        let handle = self.handle(line)?;
        let signal = self
            .config
            .line(line)
            .and_then(|config| config.speed_setpoint.clone())
            .ok_or_else(|| {
                MesError::InvalidRequest(format!("line {line} has no speed setpoint signal"))
            })?;
        if !setpoint.is_finite() || setpoint < 0.0 {
            return Err(MesError::InvalidRequest(format!(
                "invalid speed setpoint {setpoint}"
            )));
        }
        let value = match self.bridge.registry().binding(&signal)?.kind {
            DataKind::Integer => SignalValue::Int(setpoint.round() as i64),
            DataKind::Float => SignalValue::Float(setpoint),
            DataKind::Boolean => {
                return Err(MesError::InvalidRequest(format!(
                    "speed setpoint {signal} is not numeric"
                )))
            }
        };
        self.bridge.write(&signal, value).await?;
        handle.record_speed(setpoint).await
    }

    /// Add stock to a material.
    pub async fn restock(&self, material: &str, quantity: u64) -> MesResult<InventoryItem> {
        let change = self.inventory.restock(material, quantity)?;
        info!(material, quantity, on_hand = change.item.on_hand, "material restocked");
        self.journal.record(change.to_event());
        if !change.item.below_threshold() {
            self.alarms
                .clear(&AlarmCondition::LowInventory {
                    material: material.to_owned(),
                })
                .await;
        }
        Ok(change.item)
    }

    pub async fn acknowledge_alarm(&self, alarm_id: &str) -> MesResult<Alarm> {
        self.alarms.acknowledge(alarm_id).await
    }

    /// Current state of an order known to its line worker.
    pub async fn order(&self, order_id: &OrderId) -> MesResult<OrderSnapshot> {
        let line = self.line_of(order_id)?;
        self.handle(&line)?
            .order(order_id.clone())
            .await?
            .ok_or_else(|| MesError::UnknownOrder(order_id.to_string()))
    }

    /// Persisted view of an order, including long-finished ones.
    pub fn order_view(&self, order_id: &OrderId) -> Option<OrderView> {
        self.read_model.read().order(order_id).cloned()
    }

    pub async fn line_status(&self, line: &LineId) -> MesResult<LineStatus> {
        self.handle(line)?.status().await
    }

    pub fn line_ids(&self) -> Vec<LineId> {
        self.lines.keys().cloned().collect()
    }

    /// Active alarms, most severe first.
    pub async fn alarms(&self) -> Vec<Alarm> {
        self.alarms.active().await
    }

    pub async fn alarm_history(&self) -> Vec<Alarm> {
        self.alarms.history().await
    }

    pub fn inventory(&self) -> Vec<InventoryItem> {
        self.inventory.snapshot()
    }

    pub async fn production_status(&self) -> MesResult<ProductionStatus> {
        let lines = join_all(self.lines.values().map(|handle| handle.status()))
            .await
            .into_iter()
            .collect::<MesResult<Vec<LineStatus>>>()?;
        let mut orders_by_state = BTreeMap::new();
        for status in &lines {
            for (state, count) in &status.orders_by_state {
                *orders_by_state.entry(state.clone()).or_default() += *count;
            }
        }
        Ok(ProductionStatus {
            generated_at: Utc::now(),
            lines,
            orders_by_state,
            active_alarms: self.alarms.active().await,
            inventory: self.inventory.snapshot(),
            shedding: self.bridge.is_shedding(),
            write_latency_ms: self.sink.write_latency().as_millis() as u64,
        })
    }

    /// `readSince(cursor)`: persisted events after `cursor`, oldest first.
    pub async fn events_since(&self, cursor: u64, limit: usize) -> MesResult<Vec<EventRecord>> {
        Ok(self.sink.read_since(cursor, limit).await?)
    }

    /// Fold everything appended so far into the read model.
    pub async fn refresh_read_model(&self) -> MesResult<usize> {
        Ok(catch_up(&self.sink, &self.read_model).await?)
    }

    pub fn with_read_model<R>(&self, view: impl FnOnce(&ReadModel) -> R) -> R {
        view(&self.read_model.read())
    }

    pub fn bridge(&self) -> &SubscriptionBridge {
        &self.bridge
    }

    /// Stop every task. Pending stock events are flushed before the journal exits.
    pub async fn shutdown(self) {
        for subscription in &self.subscriptions {
            self.bridge.unsubscribe(*subscription);
        }
        let _ = self.shutdown.send(());
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "engine task ended abnormally");
            }
        }
        self.bridge.shutdown().await;
        let unsent = self.alarms.flush().await;
        if unsent > 0 {
            warn!(unsent, "alarm events not persisted at shutdown");
        }
        info!("production engine stopped");
    }

    fn handle(&self, line: &LineId) -> MesResult<&LineHandle> {
        self.lines
            .get(line)
            .ok_or_else(|| MesError::InvalidLine(line.to_string()))
    }

    fn line_of(&self, order_id: &OrderId) -> MesResult<LineId> {
        self.directory
            .lock()
            .get(order_id)
            .cloned()
            .ok_or_else(|| MesError::UnknownOrder(order_id.to_string()))
    }
}

async fn catch_up(
    sink: &PersistenceSink,
    model: &RwLock<ReadModel>,
) -> r_mes_persistence::Result<usize> {
    let mut applied = 0usize;
    loop {
        let cursor = model.read().cursor();
        let batch = sink.read_since(cursor, PROJECTION_BATCH).await?;
        if batch.is_empty() {
            return Ok(applied);
        }
        let mut model = model.write();
        for record in &batch {
            if model.apply(record) {
                applied += 1;
            }
        }
    }
}

async fn project(
    sink: PersistenceSink,
    model: Arc<RwLock<ReadModel>>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                if let Err(err) = catch_up(&sink, &model).await {
                    warn!(error = %err, "read model projection failed");
                }
            }
        }
    }
    debug!("read model projector stopped");
}
