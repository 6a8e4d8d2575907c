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
use std::time::Duration;

use parking_lot::Mutex;
use r_mes_common::{
    BackoffConfig, BridgeConfig, DataKind, MesError, PhysicalAddress, SignalEvent,
    SignalPriority, SignalQuality, SignalValue, TagConfig, UpdateOrigin,
};
use r_mes_net::{
    BridgeNotice, DeviceAdapter, ModbusAdapter, SignalCallback, SimulatedDevice,
    SubscriptionBridge, TagRegistry,
};
use r_mes_net::adapters::modbus::ModbusConfig;
use serde_json::json;
use tokio::time::sleep;

const COUNT: PhysicalAddress = PhysicalAddress::InputRegister(30001);
const RUNNING: PhysicalAddress = PhysicalAddress::Coil(1);
const TEMPERATURE: PhysicalAddress = PhysicalAddress::HoldingRegister(40003);

fn tag(name: &str, address: PhysicalAddress, kind: DataKind, writable: bool, priority: SignalPriority) -> TagConfig {
    TagConfig {
        name: name.into(),
        endpoint: "plc-1".into(),
        address,
        kind,
        writable,
        priority,
        staleness_window: None,
    }
}

fn bridge_config() -> BridgeConfig {
    BridgeConfig {
        backoff: BackoffConfig {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.2,
        },
        staleness_window: Duration::from_secs(5),
        poll_interval: Duration::from_millis(100),
        ..BridgeConfig::default()
    }
}

fn setup() -> (SimulatedDevice, SubscriptionBridge) {
    let registry = TagRegistry::from_config(
        &[
            tag("c1.count", COUNT, DataKind::Integer, false, SignalPriority::High),
            tag("c1.running", RUNNING, DataKind::Boolean, true, SignalPriority::High),
            tag("c1.temperature", TEMPERATURE, DataKind::Float, false, SignalPriority::Low),
        ],
        Duration::from_secs(5),
    )
    .unwrap();
    let device = SimulatedDevice::new();
    let adapter: Arc<dyn DeviceAdapter> = Arc::new(ModbusAdapter::new(
        ModbusConfig::new("plc-1", "192.168.1.100:502"),
        device.clone(),
    ));
    let bridge = SubscriptionBridge::new(Arc::new(registry), bridge_config(), vec![adapter], None);
    (device, bridge)
}

fn recorder() -> (Arc<Mutex<Vec<SignalEvent>>>, SignalCallback) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: SignalCallback = Arc::new(move |event: &SignalEvent| sink.lock().push(event.clone()));
    (events, callback)
}

#[tokio::test(start_paused = true)]
async fn reconnect_resyncs_before_incremental_updates() {
    let (device, bridge) = setup();
    device.inject(COUNT, json!(3));
    let (events, callback) = recorder();
    bridge.subscribe(["c1.count"], callback).unwrap();

    bridge.connect("plc-1").await.unwrap();
    {
        let events = events.lock();
        assert_eq!(events[0].origin, UpdateOrigin::Resync);
        assert_eq!(events[0].value, Some(SignalValue::Int(3)));
    }

    device.inject(COUNT, json!(4));
    sleep(Duration::from_millis(300)).await;
    assert_eq!(
        events.lock().last().map(|e| (e.origin, e.value)),
        Some((UpdateOrigin::Incremental, Some(SignalValue::Int(4))))
    );

    // 10s outage, twice the staleness window
    device.set_link(false);
    sleep(Duration::from_secs(10)).await;
    assert_eq!(bridge.snapshot("c1.count").unwrap().quality, SignalQuality::Stale);
    assert!(!bridge.is_connected("plc-1"));
    let stale_at = events
        .lock()
        .iter()
        .position(|e| e.quality == SignalQuality::Stale)
        .expect("stale transition delivered");

    device.inject(COUNT, json!(9));
    device.set_link(true);
    sleep(Duration::from_secs(40)).await;
    assert!(bridge.is_connected("plc-1"));
    let snapshot = bridge.snapshot("c1.count").unwrap();
    assert_eq!(snapshot.quality, SignalQuality::Good);
    assert_eq!(snapshot.value, Some(SignalValue::Int(9)));

    device.inject(COUNT, json!(10));
    sleep(Duration::from_millis(300)).await;

    let events = events.lock();
    let after_gap: Vec<_> = events[stale_at + 1..].iter().collect();
    assert_eq!(after_gap[0].origin, UpdateOrigin::Resync);
    assert_eq!(after_gap[0].value, Some(SignalValue::Int(9)));
    let last = after_gap.last().unwrap();
    assert_eq!(last.origin, UpdateOrigin::Incremental);
    assert_eq!(last.value, Some(SignalValue::Int(10)));
    for pair in events.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
    drop(events);
    bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn written_value_is_echoed_within_staleness_window() {
    let (device, bridge) = setup();
    let mut notices = bridge.notices();
    bridge.connect("plc-1").await.unwrap();

    bridge
        .write("c1.running", SignalValue::Bool(true))
        .await
        .unwrap();
    sleep(Duration::from_millis(250)).await;
    let mut accepted = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if let BridgeNotice::WriteAccepted { signal } = notice {
            accepted.push(signal);
        }
    }
    assert_eq!(accepted, vec!["c1.running".to_owned()]);

    let signal = bridge.snapshot("c1.running").unwrap();
    assert_eq!(signal.value, Some(SignalValue::Bool(true)));
    assert_eq!(signal.quality, SignalQuality::Good);
    assert_eq!(device.accepted_writes(), 1);
    bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_writes_are_reported_and_not_retried() {
    let (device, bridge) = setup();
    let mut notices = bridge.notices();
    bridge.connect("plc-1").await.unwrap();

    let read_only = bridge.write("c1.count", SignalValue::Int(1)).await;
    assert!(matches!(read_only, Err(MesError::WriteRejected { .. })));

    device.reject_writes(Some("illegal data value".into()));
    let refused = bridge.write("c1.running", SignalValue::Bool(true)).await;
    assert!(matches!(refused, Err(MesError::WriteRejected { .. })));
    sleep(Duration::from_secs(2)).await;
    assert_eq!(device.accepted_writes(), 0);

    let mut rejected = 0;
    while let Ok(notice) = notices.try_recv() {
        if matches!(notice, BridgeNotice::WriteRejected { .. }) {
            rejected += 1;
        }
    }
    assert_eq!(rejected, 2);
    bridge.shutdown().await;
}

#[tokio::test]
async fn subscribing_to_unknown_signal_fails() {
    let (_device, bridge) = setup();
    let (_events, callback) = recorder();
    let err = bridge
        .subscribe(["c1.count", "c9.count"], callback)
        .unwrap_err();
    assert_eq!(err, MesError::UnknownSignal("c9.count".into()));
    assert!(matches!(
        bridge.write("c9.speed", SignalValue::Float(1.0)).await,
        Err(MesError::UnknownSignal(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn malformed_payload_marks_signal_bad() {
    let (device, bridge) = setup();
    let mut notices = bridge.notices();
    let (events, callback) = recorder();
    bridge.subscribe(["c1.count"], callback).unwrap();
    bridge.connect("plc-1").await.unwrap();

    device.inject(COUNT, json!("0xZZ"));
    sleep(Duration::from_millis(250)).await;

    assert_eq!(bridge.snapshot("c1.count").unwrap().quality, SignalQuality::Bad);
    let last = events.lock().last().cloned().unwrap();
    assert_eq!(last.quality, SignalQuality::Bad);
    assert_eq!(last.value, None);
    assert!(matches!(
        notices.try_recv(),
        Ok(BridgeNotice::MalformedPayload { ref signal, .. }) if signal == "c1.count"
    ));
    bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_first_connect_retries_in_background() {
    let (device, bridge) = setup();
    device.set_link(false);
    let err = bridge.connect("plc-1").await.unwrap_err();
    assert!(err.is_transient());

    device.set_link(true);
    sleep(Duration::from_secs(5)).await;
    assert!(bridge.is_connected("plc-1"));
    bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shedding_drops_low_priority_signals_only() {
    let (device, bridge) = setup();
    let (events, callback) = recorder();
    bridge
        .subscribe(["c1.count", "c1.temperature"], callback)
        .unwrap();
    bridge.connect("plc-1").await.unwrap();

    bridge.set_shedding(true);
    device.inject(TEMPERATURE, json!(22.5));
    device.inject(COUNT, json!(1));
    sleep(Duration::from_millis(250)).await;

    let delivered: Vec<String> = events.lock().iter().map(|e| e.signal.clone()).collect();
    assert_eq!(delivered, vec!["c1.count".to_owned()]);
    assert_eq!(
        bridge.snapshot("c1.temperature").unwrap().value,
        Some(SignalValue::Float(22.5))
    );
    bridge.shutdown().await;
}
