//! ---
//! mes_section: "01-core-functionality"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Alarm lifecycle and condition monitoring."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use r_mes_common::{
    Alarm, AlarmCondition, AlarmConfig, AlarmSeverity, AppConfig, MesError, MesResult,
    SignalQuality,
};
use r_mes_metrics::ProductionMetrics;
use r_mes_net::{BridgeNotice, SubscriptionBridge};
use r_mes_persistence::{
    AlarmAcknowledged, AlarmCleared, DomainEvent, NewEvent, PersistenceSink, ReadModel,
    ALARM_SUBJECT,
};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::inventory::Inventory;
use crate::journal::EventJournal;
use crate::line::LineHandle;

#[derive(Debug, Default)]
struct AlarmBook {
    alarms: IndexMap<String, Alarm>,
    active: HashMap<AlarmCondition, String>,
    sequence: u64,
    unsent: VecDeque<NewEvent>,
}

struct AlarmInner {
    book: Mutex<AlarmBook>,
    sink: PersistenceSink,
    metrics: Option<ProductionMetrics>,
}

/// Deduplicated alarm registry.
///
/// At most one alarm is active per [`AlarmCondition`]; raising an active
/// condition again is a no-op. Raise and clear events are appended in order and
/// kept for retry when the sink is down, so an alarm about a failing sink is
/// still raised.
#[derive(Clone)]
pub struct AlarmManager {
    inner: Arc<AlarmInner>,
}

impl std::fmt::Debug for AlarmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmManager").finish_non_exhaustive()
    }
}

impl AlarmManager {
    pub fn new(sink: PersistenceSink, metrics: Option<ProductionMetrics>) -> Self {
        Self {
            inner: Arc::new(AlarmInner {
                book: Mutex::new(AlarmBook::default()),
                sink,
                metrics,
            }),
        }
    }

    /// Load alarms from the projection after a restart. Returns the active count.
    pub async fn restore(&self, model: &ReadModel) -> usize {
        let mut book = self.inner.book.lock().await;
        for alarm in model.alarms() {
            if alarm.is_active() {
                book.active
                    .insert(alarm.condition.clone(), alarm.id.clone());
            }
            book.alarms.insert(alarm.id.clone(), alarm.clone());
        }
        book.sequence = model.next_sequence(ALARM_SUBJECT) - 1;
        self.publish(&book);
        book.active.len()
    }

    /// Raise `condition` unless it is already active.
    pub async fn raise(&self, condition: AlarmCondition, message: impl Into<String>) -> Option<Alarm> {
        let mut book = self.inner.book.lock().await;
        if book.active.contains_key(&condition) {
            return None;
        }
        let alarm = Alarm {
            id: Uuid::new_v4().to_string(),
            severity: condition.default_severity(),
            condition: condition.clone(),
            message: message.into(),
            raised_at: Utc::now(),
            cleared_at: None,
            acknowledged_at: None,
        };
        match alarm.severity {
            AlarmSeverity::Critical => {
                error!(alarm_id = %alarm.id, condition = %condition, message = %alarm.message, "alarm raised")
            }
            severity => {
                warn!(alarm_id = %alarm.id, condition = %condition, severity = %severity, message = %alarm.message, "alarm raised")
            }
        }
        book.active.insert(condition, alarm.id.clone());
        book.alarms.insert(alarm.id.clone(), alarm.clone());
        self.persist(&mut book, DomainEvent::AlarmRaised(alarm.clone()))
            .await;
        self.publish(&book);
        Some(alarm)
    }

    /// Clear `condition` if it is active.
    pub async fn clear(&self, condition: &AlarmCondition) -> Option<Alarm> {
        let mut book = self.inner.book.lock().await;
        let alarm_id = book.active.remove(condition)?;
        let cleared_at = Utc::now();
        let alarm = {
            let alarm = book.alarms.get_mut(&alarm_id)?;
            alarm.cleared_at = Some(cleared_at);
            alarm.clone()
        };
        info!(alarm_id = %alarm_id, condition = %condition, "alarm cleared");
        self.persist(
            &mut book,
            DomainEvent::AlarmCleared(AlarmCleared {
                alarm_id,
                condition: condition.clone(),
                cleared_at,
            }),
        )
        .await;
        self.publish(&book);
        Some(alarm)
    }

    /// Record an operator acknowledgment. Acknowledging twice is harmless.
    pub async fn acknowledge(&self, alarm_id: &str) -> MesResult<Alarm> {
        let mut book = self.inner.book.lock().await;
        let alarm = book
            .alarms
            .get(alarm_id)
            .cloned()
            .ok_or_else(|| MesError::InvalidRequest(format!("unknown alarm '{alarm_id}'")))?;
        if alarm.is_acknowledged() {
            return Ok(alarm);
        }
        self.flush_locked(&mut book).await;
        if !book.unsent.is_empty() {
            return Err(MesError::Persistence(
                "alarm events are still waiting for the event log".into(),
            ));
        }
        let acknowledged_at = Utc::now();
        let event = NewEvent::new(
            book.sequence + 1,
            DomainEvent::AlarmAcknowledged(AlarmAcknowledged {
                alarm_id: alarm_id.to_owned(),
                acknowledged_at,
            }),
        );
        self.inner.sink.append(event).await?;
        book.sequence += 1;
        let alarm = book
            .alarms
            .get_mut(alarm_id)
            .map(|alarm| {
                alarm.acknowledged_at = Some(acknowledged_at);
                alarm.clone()
            })
            .unwrap_or(alarm);
        info!(alarm_id, condition = %alarm.condition, "alarm acknowledged");
        Ok(alarm)
    }

    /// Active alarms, most severe first.
    pub async fn active(&self) -> Vec<Alarm> {
        let book = self.inner.book.lock().await;
        let mut active: Vec<Alarm> = book
            .alarms
            .values()
            .filter(|alarm| alarm.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            a.severity
                .cmp(&b.severity)
                .then(a.raised_at.cmp(&b.raised_at))
        });
        active
    }

    /// Every alarm known since start, oldest first.
    pub async fn history(&self) -> Vec<Alarm> {
        self.inner.book.lock().await.alarms.values().cloned().collect()
    }

    pub async fn is_active(&self, condition: &AlarmCondition) -> bool {
        self.inner.book.lock().await.active.contains_key(condition)
    }

    /// Retry alarm events the sink refused earlier. Returns how many are still waiting.
    pub async fn flush(&self) -> usize {
        let mut book = self.inner.book.lock().await;
        self.flush_locked(&mut book).await;
        book.unsent.len()
    }

    async fn persist(&self, book: &mut AlarmBook, event: DomainEvent) {
        book.sequence += 1;
        book.unsent.push_back(NewEvent::new(book.sequence, event));
        self.flush_locked(book).await;
    }

    async fn flush_locked(&self, book: &mut AlarmBook) {
        while let Some(event) = book.unsent.front().cloned() {
            match self.inner.sink.append(event).await {
                Ok(_) => {
                    book.unsent.pop_front();
                }
                Err(err) => {
                    debug!(backlog = book.unsent.len(), error = %err, "alarm event kept for retry");
                    break;
                }
            }
        }
    }

    fn publish(&self, book: &AlarmBook) {
        let Some(metrics) = &self.inner.metrics else {
            return;
        };
        for severity in [
            AlarmSeverity::Critical,
            AlarmSeverity::High,
            AlarmSeverity::Medium,
            AlarmSeverity::Low,
        ] {
            let count = book
                .alarms
                .values()
                .filter(|alarm| alarm.is_active() && alarm.severity == severity)
                .count();
            metrics.set_active_alarms(severity.as_str(), count);
        }
    }
}

/// Periodic detector for the conditions that are not raised inline by the
/// line workers: signal quality, line faults and stalls, over-threshold
/// readings, stock, lost connections, pass rate and persistence backpressure.
pub struct AlarmMonitor {
    alarms: AlarmManager,
    bridge: SubscriptionBridge,
    lines: Vec<LineHandle>,
    inventory: Arc<Inventory>,
    journal: EventJournal,
    sink: PersistenceSink,
    config: AlarmConfig,
    pass_rate_floor: f64,
    pass_rate_min_samples: usize,
    vibration: HashSet<String>,
    /// Upper alarm limit per signal; vibration signals use the shared threshold.
    thresholds: HashMap<String, f64>,
    degraded_since: HashMap<String, Instant>,
    down_since: HashMap<String, Instant>,
    metrics: Option<ProductionMetrics>,
}

impl AlarmMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &AppConfig,
        alarms: AlarmManager,
        bridge: SubscriptionBridge,
        lines: Vec<LineHandle>,
        inventory: Arc<Inventory>,
        journal: EventJournal,
        sink: PersistenceSink,
        metrics: Option<ProductionMetrics>,
    ) -> Self {
        let vibration: HashSet<String> = config
            .lines
            .values()
            .filter_map(|line| line.vibration.clone())
            .collect();
        let mut thresholds: HashMap<String, f64> = config
            .alarms
            .signal_thresholds
            .iter()
            .map(|(signal, limit)| (signal.clone(), *limit))
            .collect();
        for signal in &vibration {
            thresholds.insert(signal.clone(), config.alarms.vibration_threshold);
        }
        Self {
            alarms,
            bridge,
            lines,
            inventory,
            journal,
            sink,
            config: config.alarms.clone(),
            pass_rate_floor: config.quality.pass_rate_floor,
            pass_rate_min_samples: config.quality.pass_rate_min_samples,
            vibration,
            thresholds,
            degraded_since: HashMap::new(),
            down_since: HashMap::new(),
            metrics,
        }
    }

    pub async fn run(
        mut self,
        mut notices: broadcast::Receiver<BridgeNotice>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = interval(self.config.evaluation_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("alarm monitor shutdown");
                    break;
                }
                notice = notices.recv() => match notice {
                    Ok(notice) => self.on_notice(notice).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "alarm monitor fell behind bridge notices");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("bridge notices closed");
                        break;
                    }
                },
                _ = ticker.tick() => self.evaluate().await,
            }
        }
    }

    pub async fn on_notice(&mut self, notice: BridgeNotice) {
        match notice {
            BridgeNotice::ConnectionLost { endpoint, .. } => {
                self.down_since.entry(endpoint).or_insert_with(Instant::now);
            }
            BridgeNotice::ConnectionRestored { endpoint, .. } => {
                self.down_since.remove(&endpoint);
                self.alarms
                    .clear(&AlarmCondition::ConnectionLost { endpoint })
                    .await;
            }
            BridgeNotice::MalformedPayload { signal, payload } => {
                let message = format!("signal {signal} delivered malformed payload {payload}");
                self.alarms
                    .raise(AlarmCondition::MalformedPayload { signal }, message)
                    .await;
            }
            BridgeNotice::WriteAccepted { signal } => {
                self.alarms
                    .clear(&AlarmCondition::WriteRejected { signal })
                    .await;
            }
            BridgeNotice::WriteRejected { signal, reason } => {
                let message = format!("write to {signal} rejected: {reason}");
                self.alarms
                    .raise(AlarmCondition::WriteRejected { signal }, message)
                    .await;
            }
        }
    }

    /// One detection pass.
    pub async fn evaluate(&mut self) {
        self.check_signals().await;
        self.check_lines().await;
        self.check_inventory().await;
        self.check_connections().await;
        self.check_backpressure().await;
        let backlog = self.alarms.flush().await;
        if backlog > 0 {
            debug!(backlog, "alarm events waiting for the event log");
        }
    }

    async fn check_signals(&mut self) {
        let now = Instant::now();
        for signal in self.bridge.signals() {
            let name = signal.name.clone();
            if signal.quality == SignalQuality::Good {
                self.degraded_since.remove(&name);
                self.alarms
                    .clear(&AlarmCondition::SignalQuality {
                        signal: name.clone(),
                    })
                    .await;
                self.alarms
                    .clear(&AlarmCondition::MalformedPayload {
                        signal: name.clone(),
                    })
                    .await;
                if let Some(&limit) = self.thresholds.get(&name) {
                    let (condition, label) = if self.vibration.contains(&name) {
                        let condition = AlarmCondition::Vibration {
                            signal: name.clone(),
                        };
                        (condition, "vibration on")
                    } else {
                        let condition = AlarmCondition::OverThreshold {
                            signal: name.clone(),
                        };
                        (condition, "signal")
                    };
                    match signal.value.and_then(|value| value.as_f64()) {
                        Some(level) if level > limit => {
                            let message =
                                format!("{label} {name} at {level:.2}, threshold {limit:.2}");
                            self.alarms.raise(condition, message).await;
                        }
                        _ => {
                            self.alarms.clear(&condition).await;
                        }
                    }
                }
                continue;
            }
            let since = *self.degraded_since.entry(name.clone()).or_insert(now);
            let degraded_for = now.duration_since(since);
            if degraded_for >= self.config.quality_grace {
                let message = format!(
                    "signal {name} has been {} for {}s",
                    signal.quality,
                    degraded_for.as_secs()
                );
                self.alarms
                    .raise(AlarmCondition::SignalQuality { signal: name }, message)
                    .await;
            }
        }
    }

    async fn check_lines(&mut self) {
        for handle in &self.lines {
            let status = match handle.status().await {
                Ok(status) => status,
                Err(err) => {
                    debug!(line = %handle.line(), error = %err, "line status unavailable");
                    continue;
                }
            };
            let line = status.line.clone();

            let fault = AlarmCondition::LineFault { line: line.clone() };
            match status.fault_duration {
                Some(duration) if duration >= self.config.fault_grace => {
                    let message =
                        format!("line {line} in FAULT for {}s", duration.as_secs());
                    self.alarms.raise(fault, message).await;
                }
                Some(_) => {}
                None => {
                    self.alarms.clear(&fault).await;
                }
            }

            let stalled = AlarmCondition::ConveyorStalled { line: line.clone() };
            match status.idle_duration {
                Some(duration) if duration >= self.config.stall_timeout => {
                    let message = format!(
                        "line {line} running without unit progress for {}s",
                        duration.as_secs()
                    );
                    self.alarms.raise(stalled, message).await;
                }
                _ => {
                    self.alarms.clear(&stalled).await;
                }
            }

            if status.verdicts >= self.pass_rate_min_samples {
                if let Some(rate) = status.pass_rate {
                    let condition = AlarmCondition::LowPassRate { line: line.clone() };
                    let percent = rate * 100.0;
                    if percent < self.pass_rate_floor {
                        let message = format!(
                            "line {line} pass rate {percent:.1}% below {:.1}%",
                            self.pass_rate_floor
                        );
                        self.alarms.raise(condition, message).await;
                    } else {
                        self.alarms.clear(&condition).await;
                    }
                }
            }
        }
    }

    async fn check_inventory(&mut self) {
        for item in self.inventory.snapshot() {
            let condition = AlarmCondition::LowInventory {
                material: item.material.clone(),
            };
            if !item.below_threshold() {
                self.alarms.clear(&condition).await;
                continue;
            }
            let message = format!(
                "{} below reorder threshold: {} on hand, threshold {}",
                item.material, item.on_hand, item.reorder_threshold
            );
            self.alarms.raise(condition.clone(), message).await;

            let Some(quantity) = self.inventory.auto_restock(&item.material) else {
                continue;
            };
            match self.inventory.restock(&item.material, quantity) {
                Ok(change) => {
                    info!(material = %item.material, quantity, on_hand = change.item.on_hand, "auto-restock applied");
                    let replenished = !change.item.below_threshold();
                    self.journal.record(change.to_event());
                    if replenished {
                        self.alarms.clear(&condition).await;
                    }
                }
                Err(err) => {
                    warn!(material = %item.material, error = %err, "auto-restock failed");
                }
            }
        }
    }

    async fn check_connections(&mut self) {
        let now = Instant::now();
        for endpoint in self.bridge.endpoints() {
            if self.bridge.is_connected(&endpoint) {
                if self.down_since.remove(&endpoint).is_some() {
                    self.alarms
                        .clear(&AlarmCondition::ConnectionLost {
                            endpoint: endpoint.clone(),
                        })
                        .await;
                }
                continue;
            }
            let since = *self.down_since.entry(endpoint.clone()).or_insert(now);
            let down_for = now.duration_since(since);
            if down_for >= self.config.disconnect_grace {
                let message = format!("endpoint {endpoint} unreachable for {}s", down_for.as_secs());
                self.alarms
                    .raise(AlarmCondition::ConnectionLost { endpoint }, message)
                    .await;
            }
        }
    }

    async fn check_backpressure(&mut self) {
        let latency = self.sink.write_latency();
        let budget = self.config.write_latency_budget;
        if latency > budget {
            if !self.bridge.set_shedding(true) {
                warn!(latency_ms = latency.as_millis() as u64, budget_ms = budget.as_millis() as u64, "event sink over latency budget; shedding low-priority signals");
            }
            if let Some(metrics) = &self.metrics {
                metrics.set_shedding(true);
            }
            let message = format!(
                "event sink latency {}ms over budget {}ms",
                latency.as_millis(),
                budget.as_millis()
            );
            self.alarms
                .raise(AlarmCondition::PersistenceBackpressure, message)
                .await;
        } else if latency <= budget / 2 && self.bridge.is_shedding() {
            self.bridge.set_shedding(false);
            info!(latency_ms = latency.as_millis() as u64, "event sink recovered; delivering all signals");
            if let Some(metrics) = &self.metrics {
                metrics.set_shedding(false);
            }
            self.alarms
                .clear(&AlarmCondition::PersistenceBackpressure)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use r_mes_common::{LineId, OrderId};
    use r_mes_persistence::MemoryEventStore;

    use super::*;

    fn manager() -> (Arc<MemoryEventStore>, AlarmManager) {
        let store = Arc::new(MemoryEventStore::new());
        let sink = PersistenceSink::new(store.clone(), None);
        (store, AlarmManager::new(sink, None))
    }

    #[tokio::test]
    async fn conditions_are_deduplicated_while_active() {
        let (store, alarms) = manager();
        let condition = AlarmCondition::LineFault {
            line: LineId::from("C1"),
        };
        let first = alarms.raise(condition.clone(), "line C1 in FAULT").await;
        assert!(first.is_some());
        assert!(alarms.raise(condition.clone(), "again").await.is_none());
        assert_eq!(alarms.active().await.len(), 1);

        alarms.clear(&condition).await.unwrap();
        assert!(alarms.clear(&condition).await.is_none());
        let second = alarms.raise(condition, "line C1 in FAULT").await.unwrap();
        assert_ne!(first.unwrap().id, second.id);

        let ids: Vec<String> = store
            .records()
            .iter()
            .map(|record| record.event_id.clone())
            .collect();
        assert_eq!(ids, vec!["alarms:1", "alarms:2", "alarms:3"]);
    }

    #[tokio::test]
    async fn alarms_survive_a_failing_sink() {
        let (store, alarms) = manager();
        store.fail_all(Some("disk full".into()));
        let condition = AlarmCondition::PersistenceFailure {
            order_id: OrderId::from("PO_1"),
        };
        let alarm = alarms.raise(condition.clone(), "order halted").await.unwrap();
        assert!(alarms.is_active(&condition).await);
        assert_eq!(alarms.flush().await, 1);
        assert!(matches!(
            alarms.acknowledge(&alarm.id).await,
            Err(MesError::Persistence(_))
        ));

        store.fail_all(None);
        assert_eq!(alarms.flush().await, 0);
        let acknowledged = alarms.acknowledge(&alarm.id).await.unwrap();
        assert!(acknowledged.is_acknowledged());
        assert!(acknowledged.is_active());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn active_alarms_are_ordered_by_severity() {
        let (_store, alarms) = manager();
        alarms
            .raise(
                AlarmCondition::LowInventory {
                    material: "bolt".into(),
                },
                "low",
            )
            .await;
        alarms
            .raise(
                AlarmCondition::ConnectionLost {
                    endpoint: "plc-1".into(),
                },
                "down",
            )
            .await;
        let severities: Vec<AlarmSeverity> = alarms
            .active()
            .await
            .into_iter()
            .map(|alarm| alarm.severity)
            .collect();
        assert_eq!(severities, vec![AlarmSeverity::Critical, AlarmSeverity::Low]);
        assert!(matches!(
            alarms.acknowledge("missing").await,
            Err(MesError::InvalidRequest(_))
        ));
    }
}
