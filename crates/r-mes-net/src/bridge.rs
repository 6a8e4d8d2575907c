//! ---
//! mes_section: "05-networking-external-interfaces"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Field connectivity, tag registry, and device adapters."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
//! Subscription bridge: one dispatch loop per field endpoint.
//!
//! Each loop owns its endpoint's session. It drains device-ordered changes,
//! reconnects with backoff after a drop, and performs a full re-read of the
//! endpoint's signals before incremental delivery resumes. Staleness is swept
//! by the same loop so every event for a signal leaves from one task.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use r_mes_common::{
    endpoint_span, BridgeConfig, MesError, MesResult, PhysicalAddress, Signal, SignalEvent, SignalPriority,
    SignalQuality, SignalValue, UpdateOrigin,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

use crate::adapters::{AdapterError, AdapterEvent, DeviceAdapter};
use crate::backoff::Backoff;
use crate::metrics::BridgeMetrics;
use crate::tags::{TagBinding, TagRegistry};

/// Subscriber callback. Runs on the dispatch loop, so it must only enqueue.
pub type SignalCallback = Arc<dyn Fn(&SignalEvent) + Send + Sync>;

/// Handle returned by [`SubscriptionBridge::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Out-of-band conditions reported by the bridge, consumed by the alarm manager.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeNotice {
    /// Session to an endpoint dropped.
    ConnectionLost {
        /// Endpoint name.
        endpoint: String,
        /// When the drop was detected.
        at: DateTime<Utc>,
    },
    /// Session re-established and resynchronised.
    ConnectionRestored {
        /// Endpoint name.
        endpoint: String,
        /// When the resync finished.
        at: DateTime<Utc>,
    },
    /// Device payload did not decode to the tag's data kind; the signal is `BAD`.
    MalformedPayload {
        /// Affected signal.
        signal: String,
        /// Raw payload as received.
        payload: Value,
    },
    /// Command write acknowledged by the device.
    WriteAccepted {
        /// Target signal.
        signal: String,
    },
    /// Command write refused.
    WriteRejected {
        /// Target signal.
        signal: String,
        /// Reason reported by the bridge or the device.
        reason: String,
    },
}

struct SignalSlot {
    signal: Signal,
    confirmed_at: Option<Instant>,
}

struct Subscription {
    id: SubscriptionId,
    signals: HashSet<String>,
    callback: SignalCallback,
}

enum Link {
    Up,
    Down { retry_at: Instant },
}

struct BridgeInner {
    registry: Arc<TagRegistry>,
    config: BridgeConfig,
    adapters: HashMap<String, Arc<dyn DeviceAdapter>>,
    slots: Mutex<HashMap<String, SignalSlot>>,
    subscriptions: RwLock<Vec<Subscription>>,
    next_subscription: AtomicU64,
    shedding: AtomicBool,
    closed: AtomicBool,
    started: Mutex<HashSet<String>>,
    connected: Mutex<HashSet<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    notices: broadcast::Sender<BridgeNotice>,
    shutdown: broadcast::Sender<()>,
    metrics: Option<BridgeMetrics>,
}

/// Owns every live field connection and turns raw updates into [`SignalEvent`]s.
#[derive(Clone)]
pub struct SubscriptionBridge {
    inner: Arc<BridgeInner>,
}

impl SubscriptionBridge {
    /// Build a bridge over the given adapters. Nothing connects until
    /// [`connect`](Self::connect) is called.
    pub fn new(
        registry: Arc<TagRegistry>,
        config: BridgeConfig,
        adapters: Vec<Arc<dyn DeviceAdapter>>,
        metrics: Option<BridgeMetrics>,
    ) -> Self {
        let slots = registry
            .all_signals()
            .into_iter()
            .filter_map(|name| {
                registry.binding(&name).ok().map(|binding| {
                    (
                        name.clone(),
                        SignalSlot {
                            signal: binding.unread_signal(),
                            confirmed_at: None,
                        },
                    )
                })
            })
            .collect();
        let adapters = adapters
            .into_iter()
            .map(|adapter| (adapter.endpoint().to_owned(), adapter))
            .collect();
        let (notices, _) = broadcast::channel(256);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(BridgeInner {
                registry,
                config,
                adapters,
                slots: Mutex::new(slots),
                subscriptions: RwLock::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                shedding: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                started: Mutex::new(HashSet::new()),
                connected: Mutex::new(HashSet::new()),
                tasks: Mutex::new(Vec::new()),
                notices,
                shutdown,
                metrics,
            }),
        }
    }

    /// Tag registry the bridge resolves names against.
    pub fn registry(&self) -> &Arc<TagRegistry> {
        &self.inner.registry
    }

    /// Register interest in `signals`. Fails with `UnknownSignal` if any name is
    /// unregistered, in which case nothing is subscribed.
    pub fn subscribe<I, S>(&self, signals: I, callback: SignalCallback) -> MesResult<SubscriptionId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let signals: HashSet<String> = signals.into_iter().map(Into::into).collect();
        for name in &signals {
            self.inner.registry.binding(name)?;
        }
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        debug!(subscription = id.0, signals = signals.len(), "subscription registered");
        self.inner.subscriptions.write().push(Subscription {
            id,
            signals,
            callback,
        });
        Ok(id)
    }

    /// Drop a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.inner.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != id);
        subscriptions.len() != before
    }

    /// Establish the session to `endpoint` and start its dispatch loop.
    ///
    /// A failed first attempt returns [`MesError::Connection`]; the loop keeps
    /// retrying in the background with exponential backoff either way.
    pub async fn connect(&self, endpoint: &str) -> MesResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MesError::ShuttingDown);
        }
        let adapter = self
            .inner
            .adapters
            .get(endpoint)
            .cloned()
            .ok_or_else(|| MesError::InvalidRequest(format!("unknown endpoint '{endpoint}'")))?;
        if !self.inner.started.lock().insert(endpoint.to_owned()) {
            return if self.is_connected(endpoint) {
                Ok(())
            } else {
                Err(MesError::Connection {
                    endpoint: endpoint.to_owned(),
                    reason: "reconnect in progress".into(),
                })
            };
        }

        let seed = endpoint
            .bytes()
            .fold(0xC0FF_EE00_u64, |acc, byte| acc.rotate_left(5) ^ u64::from(byte));
        let mut backoff = Backoff::new(self.inner.config.backoff).with_seed(seed);

        let attempt = match adapter.connect().await {
            Ok(()) => self.inner.resync(endpoint, adapter.as_ref()).await,
            Err(err) => Err(err),
        };
        let (link, result) = match attempt {
            Ok(()) => {
                self.inner.mark_connected(endpoint, true);
                info!(endpoint, "field session established");
                (Link::Up, Ok(()))
            }
            Err(err) => {
                let delay = backoff.next_delay();
                warn!(endpoint, error = %err, retry_in_ms = delay.as_millis() as u64, "connect failed; scheduling reconnect");
                self.inner.mark_connected(endpoint, false);
                (
                    Link::Down {
                        retry_at: Instant::now() + delay,
                    },
                    Err(MesError::Connection {
                        endpoint: endpoint.to_owned(),
                        reason: err.to_string(),
                    }),
                )
            }
        };

        let inner = Arc::clone(&self.inner);
        let shutdown = self.inner.shutdown.subscribe();
        let name = endpoint.to_owned();
        let span = endpoint_span(&name);
        let handle = tokio::spawn(
            async move {
                inner.run_endpoint(name, adapter, link, backoff, shutdown).await;
            }
            .instrument(span),
        );
        self.inner.tasks.lock().push(handle);
        result
    }

    /// Connect every configured endpoint. Failures are logged and retried in
    /// the background; the names of endpoints that are not up yet are returned.
    pub async fn connect_all(&self) -> Vec<String> {
        let mut pending = Vec::new();
        let endpoints: Vec<String> = self.inner.adapters.keys().cloned().collect();
        for endpoint in endpoints {
            if self.connect(&endpoint).await.is_err() {
                pending.push(endpoint);
            }
        }
        pending
    }

    /// Issue a command write and wait for the device acknowledgement.
    ///
    /// Never retried here; a failure is returned as `WriteRejected`. Both
    /// outcomes are reported through [`notices`](Self::notices), in call order.
    pub async fn write(&self, name: &str, value: SignalValue) -> MesResult<()> {
        let binding = self.inner.registry.binding(name)?.clone();
        if !binding.writable {
            return Err(self.inner.reject(name, "signal is read-only".into()));
        }
        let Some(coerced) = SignalValue::coerce(binding.kind, &value.to_raw()) else {
            return Err(self.inner.reject(
                name,
                format!("expected {} value, got {}", binding.kind, value.kind()),
            ));
        };
        let Some(adapter) = self.inner.adapters.get(&binding.endpoint).cloned() else {
            return Err(self.inner.reject(
                name,
                format!("no adapter for endpoint '{}'", binding.endpoint),
            ));
        };
        match adapter.write(&binding.address, coerced.to_raw()).await {
            Ok(()) => {
                info!(signal = name, value = %coerced, "command write acknowledged");
                self.inner.notify(BridgeNotice::WriteAccepted {
                    signal: name.to_owned(),
                });
                Ok(())
            }
            Err(err) => Err(self.inner.reject(name, err.to_string())),
        }
    }

    /// Last known state of a signal.
    pub fn snapshot(&self, name: &str) -> MesResult<Signal> {
        self.inner.registry.binding(name)?;
        self.inner
            .slots
            .lock()
            .get(name)
            .map(|slot| slot.signal.clone())
            .ok_or_else(|| MesError::UnknownSignal(name.to_owned()))
    }

    /// All signals in registration order.
    pub fn signals(&self) -> Vec<Signal> {
        let slots = self.inner.slots.lock();
        self.inner
            .registry
            .all_signals()
            .iter()
            .filter_map(|name| slots.get(name).map(|slot| slot.signal.clone()))
            .collect()
    }

    /// Start or stop dropping low-priority signals. Returns the previous setting.
    pub fn set_shedding(&self, enabled: bool) -> bool {
        let previous = self.inner.shedding.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(enabled, "low-priority signal shedding changed");
        }
        previous
    }

    /// Whether low-priority signals are currently dropped.
    pub fn is_shedding(&self) -> bool {
        self.inner.shedding.load(Ordering::SeqCst)
    }

    /// Whether the session to `endpoint` is up.
    pub fn is_connected(&self, endpoint: &str) -> bool {
        self.inner.connected.lock().contains(endpoint)
    }

    /// Configured endpoint names.
    pub fn endpoints(&self) -> Vec<String> {
        self.inner.adapters.keys().cloned().collect()
    }

    /// Stream of connection, payload and write notices.
    pub fn notices(&self) -> broadcast::Receiver<BridgeNotice> {
        self.inner.notices.subscribe()
    }

    /// Stop every dispatch loop and wait for them to exit.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown.send(());
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "dispatch loop ended abnormally");
            }
        }
        info!("subscription bridge stopped");
    }
}

impl std::fmt::Debug for SubscriptionBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionBridge")
            .field("signals", &self.inner.registry.len())
            .field("endpoints", &self.inner.adapters.len())
            .finish_non_exhaustive()
    }
}

impl BridgeInner {
    async fn run_endpoint(
        self: Arc<Self>,
        endpoint: String,
        adapter: Arc<dyn DeviceAdapter>,
        mut link: Link,
        mut backoff: Backoff,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(endpoint = %endpoint, "dispatch loop shutting down");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            link = match link {
                Link::Up => match adapter.poll_changes().await {
                    Ok(changes) => {
                        self.confirm(&endpoint, now);
                        for change in changes {
                            self.ingest(&endpoint, change, UpdateOrigin::Incremental, now);
                        }
                        Link::Up
                    }
                    Err(err) => {
                        let delay = backoff.next_delay();
                        warn!(endpoint = %endpoint, error = %err, retry_in_ms = delay.as_millis() as u64, "field session lost");
                        self.mark_connected(&endpoint, false);
                        self.notify(BridgeNotice::ConnectionLost {
                            endpoint: endpoint.clone(),
                            at: Utc::now(),
                        });
                        Link::Down {
                            retry_at: now + delay,
                        }
                    }
                },
                Link::Down { retry_at } if now >= retry_at => {
                    let attempt = match adapter.connect().await {
                        Ok(()) => self.resync(&endpoint, adapter.as_ref()).await,
                        Err(err) => Err(err),
                    };
                    match attempt {
                        Ok(()) => {
                            if let Some(metrics) = &self.metrics {
                                metrics.reconnect(&endpoint, true);
                            }
                            info!(endpoint = %endpoint, attempts = backoff.attempts(), "field session restored after full re-read");
                            backoff.reset();
                            self.mark_connected(&endpoint, true);
                            self.notify(BridgeNotice::ConnectionRestored {
                                endpoint: endpoint.clone(),
                                at: Utc::now(),
                            });
                            Link::Up
                        }
                        Err(err) => {
                            if let Some(metrics) = &self.metrics {
                                metrics.reconnect(&endpoint, false);
                            }
                            let delay = backoff.next_delay();
                            debug!(endpoint = %endpoint, error = %err, retry_in_ms = delay.as_millis() as u64, "reconnect attempt failed");
                            Link::Down {
                                retry_at: now + delay,
                            }
                        }
                    }
                }
                down @ Link::Down { .. } => down,
            };

            self.sweep_staleness(&endpoint, now);
        }
    }

    /// Full read of the endpoint's signals, delivered as `Resync` events.
    async fn resync(&self, endpoint: &str, adapter: &dyn DeviceAdapter) -> Result<(), AdapterError> {
        let addresses: Vec<PhysicalAddress> = self
            .registry
            .endpoint_bindings(endpoint)
            .map(|binding| binding.address.clone())
            .collect();
        let values = adapter.read(&addresses).await?;
        let now = Instant::now();
        debug!(endpoint, signals = values.len(), "full re-read completed");
        for value in values {
            self.ingest(endpoint, value, UpdateOrigin::Resync, now);
        }
        Ok(())
    }

    fn ingest(&self, endpoint: &str, update: AdapterEvent, origin: UpdateOrigin, now: Instant) {
        let Some(binding) = self.registry.lookup(endpoint, &update.address) else {
            debug!(endpoint, address = %update.address, "update for unregistered address ignored");
            return;
        };
        let decoded = SignalValue::coerce(binding.kind, &update.value);
        let event = {
            let mut slots = self.slots.lock();
            let slot = slots
                .entry(binding.name.clone())
                .or_insert_with(|| SignalSlot {
                    signal: binding.unread_signal(),
                    confirmed_at: None,
                });
            let timestamp = monotonic(slot.signal.timestamp, update.observed_at);
            slot.signal.timestamp = Some(timestamp);
            match decoded {
                Some(value) => {
                    slot.signal.value = Some(value);
                    slot.signal.quality = SignalQuality::Good;
                    slot.confirmed_at = Some(now);
                    SignalEvent {
                        signal: binding.name.clone(),
                        value: Some(value),
                        quality: SignalQuality::Good,
                        timestamp,
                        origin,
                    }
                }
                None => {
                    slot.signal.quality = SignalQuality::Bad;
                    slot.confirmed_at = None;
                    SignalEvent {
                        signal: binding.name.clone(),
                        value: None,
                        quality: SignalQuality::Bad,
                        timestamp,
                        origin: UpdateOrigin::Quality,
                    }
                }
            }
        };

        if decoded.is_none() {
            warn!(endpoint, signal = %binding.name, payload = %update.value, kind = %binding.kind, "malformed payload; signal marked BAD");
            if let Some(metrics) = &self.metrics {
                metrics.malformed(endpoint);
            }
            self.notify(BridgeNotice::MalformedPayload {
                signal: binding.name.clone(),
                payload: update.value,
            });
        }
        self.deliver(endpoint, binding, event);
    }

    /// A successful poll confirms every value the endpoint still holds.
    fn confirm(&self, endpoint: &str, now: Instant) {
        let mut slots = self.slots.lock();
        for binding in self.registry.endpoint_bindings(endpoint) {
            if let Some(slot) = slots.get_mut(&binding.name) {
                if slot.signal.quality == SignalQuality::Good && slot.signal.value.is_some() {
                    slot.confirmed_at = Some(now);
                }
            }
        }
    }

    fn sweep_staleness(&self, endpoint: &str, now: Instant) {
        let mut expired = Vec::new();
        {
            let mut slots = self.slots.lock();
            for binding in self.registry.endpoint_bindings(endpoint) {
                let Some(slot) = slots.get_mut(&binding.name) else {
                    continue;
                };
                let Some(confirmed_at) = slot.confirmed_at else {
                    continue;
                };
                if slot.signal.quality != SignalQuality::Good
                    || now.duration_since(confirmed_at) < binding.staleness_window
                {
                    continue;
                }
                let timestamp = monotonic(slot.signal.timestamp, Utc::now());
                slot.signal.quality = SignalQuality::Stale;
                slot.signal.timestamp = Some(timestamp);
                slot.confirmed_at = None;
                expired.push((
                    binding,
                    SignalEvent {
                        signal: binding.name.clone(),
                        value: slot.signal.value,
                        quality: SignalQuality::Stale,
                        timestamp,
                        origin: UpdateOrigin::Quality,
                    },
                ));
            }
        }
        for (binding, event) in expired {
            debug!(endpoint, signal = %binding.name, "signal marked STALE");
            self.deliver(endpoint, binding, event);
        }
    }

    fn deliver(&self, endpoint: &str, binding: &TagBinding, event: SignalEvent) {
        if binding.priority == SignalPriority::Low
            && event.origin != UpdateOrigin::Quality
            && self.shedding.load(Ordering::Relaxed)
        {
            if let Some(metrics) = &self.metrics {
                metrics.shed(endpoint);
            }
            return;
        }
        let callbacks: Vec<SignalCallback> = self
            .subscriptions
            .read()
            .iter()
            .filter(|subscription| subscription.signals.contains(&event.signal))
            .map(|subscription| Arc::clone(&subscription.callback))
            .collect();
        for callback in callbacks {
            callback(&event);
        }
        if let Some(metrics) = &self.metrics {
            metrics.delivered(endpoint, origin_label(event.origin));
        }
    }

    fn reject(&self, signal: &str, reason: String) -> MesError {
        warn!(signal, reason = %reason, "command write rejected");
        self.notify(BridgeNotice::WriteRejected {
            signal: signal.to_owned(),
            reason: reason.clone(),
        });
        MesError::WriteRejected {
            signal: signal.to_owned(),
            reason,
        }
    }

    fn mark_connected(&self, endpoint: &str, up: bool) {
        {
            let mut connected = self.connected.lock();
            if up {
                connected.insert(endpoint.to_owned());
            } else {
                connected.remove(endpoint);
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_connected(endpoint, up);
        }
    }

    fn notify(&self, notice: BridgeNotice) {
        // no receivers is fine
        let _ = self.notices.send(notice);
    }
}

fn monotonic(last: Option<DateTime<Utc>>, observed: DateTime<Utc>) -> DateTime<Utc> {
    match last {
        Some(last) if last > observed => last,
        _ => observed,
    }
}

fn origin_label(origin: UpdateOrigin) -> &'static str {
    match origin {
        UpdateOrigin::Incremental => "incremental",
        UpdateOrigin::Resync => "resync",
        UpdateOrigin::Quality => "quality",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn timestamps_never_go_backwards() {
        let now = Utc::now();
        let earlier = now - ChronoDuration::seconds(3);
        assert_eq!(monotonic(Some(now), earlier), now);
        assert_eq!(monotonic(Some(earlier), now), now);
        assert_eq!(monotonic(None, earlier), earlier);
    }
}
