//! ---
//! mes_section: "01-core-functionality"
//! mes_subsection: "testing"
//! mes_type: "test"
//! mes_scope: "code"
//! mes_description: "End-to-end production scenarios against a simulated PLC."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use r_mes_common::{
    AlarmCondition, AppConfig, FaultReason, LineId, MesError, OperatingMode, OrderState,
    PhysicalAddress,
};
use r_mes_core::{MesEngine, OrderRequest};
use r_mes_net::{build_adapter, SimulatedDevice, SubscriptionBridge, TagRegistry};
use r_mes_persistence::{EventStore, FileEventStore, MemoryEventStore, PersistenceSink};
use serde_json::json;
use tokio::time::sleep;

const RUNNING: PhysicalAddress = PhysicalAddress::Coil(1);
const FAULT: PhysicalAddress = PhysicalAddress::DiscreteInput(10001);
const COUNT: PhysicalAddress = PhysicalAddress::InputRegister(30001);
const TEMPERATURE: PhysicalAddress = PhysicalAddress::HoldingRegister(40003);
const SETPOINT: PhysicalAddress = PhysicalAddress::HoldingRegister(40010);

const MATERIAL: &str = "steel-casing";

const PLANT: &str = r#"
    site = "test-plant"

    [bridge]
    poll_interval = 50

    [bridge.endpoints.plc-1]
    protocol = "modbus"
    address = "192.168.1.100:502"

    [[tags]]
    name = "c1.running"
    endpoint = "plc-1"
    address = "coil:1"
    kind = "boolean"
    writable = true

    [[tags]]
    name = "c1.fault"
    endpoint = "plc-1"
    address = "di:10001"
    kind = "boolean"

    [[tags]]
    name = "c1.count"
    endpoint = "plc-1"
    address = "ir:30001"
    kind = "integer"

    [[tags]]
    name = "c1.temperature"
    endpoint = "plc-1"
    address = "hr:40003"
    kind = "float"

    [[tags]]
    name = "c1.speed_setpoint"
    endpoint = "plc-1"
    address = "hr:40010"
    kind = "float"
    writable = true

    [lines.C1]
    running = "c1.running"
    fault = "c1.fault"
    unit_count = "c1.count"
    speed_setpoint = "c1.speed_setpoint"
    measurements = ["c1.temperature"]

    [quality]
    sample_every = 5
    verdict_timeout = 30

    [quality.tolerances."c1.temperature"]
    min = 20.0
    max = 25.0

    [scheduling]
    cycle_interval = 100

    [alarms]
    evaluation_interval = 100

    [alarms.signal_thresholds]
    "c1.temperature" = 40.0

    [inventory.steel-casing]
    on_hand = 100
"#;

fn line() -> LineId {
    LineId::from("C1")
}

fn plant_config() -> AppConfig {
    PLANT.parse().unwrap()
}

/// Device image of an idle, healthy conveyor.
fn idle_device() -> SimulatedDevice {
    let device = SimulatedDevice::new();
    device.inject(RUNNING, json!(false));
    device.inject(FAULT, json!(false));
    device.inject(COUNT, json!(0));
    device.inject(TEMPERATURE, json!(22.0));
    device.inject(SETPOINT, json!(1.0));
    device
}

async fn start_engine(device: &SimulatedDevice, store: Arc<dyn EventStore>) -> MesEngine {
    let config = Arc::new(plant_config());
    let registry =
        TagRegistry::from_config(&config.tags, config.bridge.staleness_window).unwrap();
    let adapters = config
        .bridge
        .endpoints
        .iter()
        .map(|(name, endpoint)| build_adapter(name, endpoint, device.clone()))
        .collect();
    let bridge = SubscriptionBridge::new(
        Arc::new(registry),
        config.bridge.clone(),
        adapters,
        None,
    );
    let sink = PersistenceSink::new(store, None);
    MesEngine::start(config, bridge, sink, None).await.unwrap()
}

async fn alarm_active(engine: &MesEngine, condition: &AlarmCondition) -> bool {
    engine
        .alarms()
        .await
        .iter()
        .any(|alarm| &alarm.condition == condition)
}

/// Enough time for a poll, the worker queue and a scheduling cycle.
async fn settle() {
    sleep(Duration::from_millis(400)).await;
}

async fn running_order(
    device: &SimulatedDevice,
    engine: &MesEngine,
    quantity: u32,
) -> r_mes_common::OrderId {
    let order_id = engine
        .create_order(line(), quantity, [MATERIAL])
        .await
        .unwrap();
    device.inject(RUNNING, json!(true));
    settle().await;
    assert_eq!(engine.order(&order_id).await.unwrap().state, OrderState::InProgress);
    order_id
}

#[tokio::test(start_paused = true)]
async fn created_order_is_queued_and_starts_when_the_line_runs() {
    let device = idle_device();
    let store = Arc::new(MemoryEventStore::new());
    let engine = start_engine(&device, store.clone()).await;

    let order_id = engine
        .create_order(line(), 10, [MATERIAL])
        .await
        .unwrap();
    settle().await;

    let order = engine.order(&order_id).await.unwrap();
    assert_eq!(order.state, OrderState::Queued);
    let steel = &engine.inventory()[0];
    assert_eq!((steel.on_hand, steel.reserved), (90, 10));
    assert_eq!(engine.line_status(&line()).await.unwrap().mode, OperatingMode::Stop);

    device.inject(RUNNING, json!(true));
    settle().await;

    let order = engine.order(&order_id).await.unwrap();
    assert_eq!(order.state, OrderState::InProgress);
    assert_eq!(
        order.history,
        vec![OrderState::Created, OrderState::Queued, OrderState::InProgress]
    );
    let status = engine.line_status(&line()).await.unwrap();
    assert_eq!(status.mode, OperatingMode::Run);
    assert_eq!(status.assigned_order, Some(order_id.clone()));

    let ids: Vec<String> = store
        .records()
        .into_iter()
        .filter(|record| record.subject == order_id.as_str())
        .map(|record| record.event_id)
        .collect();
    assert_eq!(
        ids,
        vec![
            format!("{order_id}:1"),
            format!("{order_id}:2"),
            format!("{order_id}:3"),
        ]
    );

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn order_short_of_material_waits_in_created_until_restocked() {
    let device = idle_device();
    let store = Arc::new(MemoryEventStore::new());
    let engine = start_engine(&device, store.clone()).await;

    let order_id = engine
        .create_order(line(), 200, [MATERIAL])
        .await
        .unwrap();
    settle().await;

    let order = engine.order(&order_id).await.unwrap();
    assert_eq!(order.state, OrderState::Created);
    let reason = order.blocked.unwrap();
    assert!(reason.contains("insufficient material 'steel-casing'"));
    assert!(reason.contains("required 200"));
    let status = engine.line_status(&line()).await.unwrap();
    assert_eq!(status.orders[0].blocked.as_deref(), Some(reason.as_str()));
    let steel = &engine.inventory()[0];
    assert_eq!((steel.on_hand, steel.reserved), (100, 0));

    engine.restock(MATERIAL, 150).await.unwrap();
    settle().await;

    let order = engine.order(&order_id).await.unwrap();
    assert_eq!(order.state, OrderState::Queued);
    assert_eq!(order.blocked, None);
    let steel = &engine.inventory()[0];
    assert_eq!((steel.on_hand, steel.reserved), (50, 200));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_requests_do_not_create_orders() {
    let device = idle_device();
    let store = Arc::new(MemoryEventStore::new());
    let engine = start_engine(&device, store.clone()).await;

    let err = engine
        .create_order(LineId::from("C9"), 10, [MATERIAL])
        .await
        .unwrap_err();
    assert!(matches!(err, MesError::InvalidLine(_)));
    let err = engine.create_order(line(), 0, [MATERIAL]).await.unwrap_err();
    assert!(matches!(err, MesError::InvalidRequest(_)));
    let err = engine
        .create_order(line(), 10, ["unobtainium"])
        .await
        .unwrap_err();
    assert!(matches!(err, MesError::UnknownMaterial(_)));

    let status = engine.production_status().await.unwrap();
    assert!(status.orders_by_state.is_empty());

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_sample_is_reworked_and_order_completes() {
    let device = idle_device();
    let store = Arc::new(MemoryEventStore::new());
    let engine = start_engine(&device, store.clone()).await;
    let order_id = running_order(&device, &engine, 10).await;

    device.inject(COUNT, json!(5));
    settle().await;
    let order = engine.order(&order_id).await.unwrap();
    assert_eq!(order.state, OrderState::QualityCheck);
    assert_eq!(order.awaiting_verdict, Some(5));

    device.inject(TEMPERATURE, json!(27.0));
    settle().await;
    let order = engine.order(&order_id).await.unwrap();
    assert_eq!(order.state, OrderState::InProgress);
    assert_eq!((order.produced, order.rework_count), (4, 1));

    // the reworked unit is built again and re-sampled
    device.inject(COUNT, json!(6));
    settle().await;
    assert_eq!(
        engine.order(&order_id).await.unwrap().state,
        OrderState::QualityCheck
    );
    device.inject(TEMPERATURE, json!(22.5));
    settle().await;
    let order = engine.order(&order_id).await.unwrap();
    assert_eq!(order.state, OrderState::InProgress);
    assert_eq!(order.produced, 5);

    device.inject(COUNT, json!(11));
    settle().await;
    device.inject(TEMPERATURE, json!(23.0));
    settle().await;

    let order = engine.order(&order_id).await.unwrap();
    assert_eq!(order.state, OrderState::Completed);
    assert_eq!(order.produced, 10);
    assert_eq!(
        order.history,
        vec![
            OrderState::Created,
            OrderState::Queued,
            OrderState::InProgress,
            OrderState::QualityCheck,
            OrderState::Rework,
            OrderState::InProgress,
            OrderState::QualityCheck,
            OrderState::InProgress,
            OrderState::QualityCheck,
            OrderState::Completed,
        ]
    );
    assert_eq!(order.quality.len(), 3);
    let steel = &engine.inventory()[0];
    assert_eq!((steel.on_hand, steel.reserved), (90, 0));

    let status = engine.line_status(&line()).await.unwrap();
    assert_eq!(status.assigned_order, None);
    assert_eq!(status.verdicts, 3);
    assert_eq!(status.orders_by_state.get("COMPLETED"), Some(&1));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_rework_scraps_the_order_and_releases_material() {
    let device = idle_device();
    let store = Arc::new(MemoryEventStore::new());
    let engine = start_engine(&device, store.clone()).await;
    let order_id = running_order(&device, &engine, 10).await;

    for count in [5, 6, 7] {
        device.inject(COUNT, json!(count));
        settle().await;
        assert_eq!(
            engine.order(&order_id).await.unwrap().state,
            OrderState::QualityCheck
        );
        device.inject(TEMPERATURE, json!(27.0));
        settle().await;
    }

    let order = engine.order(&order_id).await.unwrap();
    assert_eq!(order.state, OrderState::Scrapped);
    assert_eq!(order.rework_count, 2);
    assert!(order.completed_at.is_some());
    // five units drawn, the other five returned to free stock
    let steel = &engine.inventory()[0];
    assert_eq!((steel.on_hand, steel.reserved), (95, 0));
    assert_eq!(engine.line_status(&line()).await.unwrap().assigned_order, None);

    let err = engine.cancel_order(&order_id).await.unwrap_err();
    assert!(matches!(err, MesError::InvalidTransition { .. }));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn line_takes_one_order_at_a_time_by_priority() {
    let device = idle_device();
    let store = Arc::new(MemoryEventStore::new());
    let engine = start_engine(&device, store.clone()).await;

    let first = engine
        .create_order(line(), 10, [MATERIAL])
        .await
        .unwrap();
    let routine = engine
        .create_order(line(), 10, [MATERIAL])
        .await
        .unwrap();
    let urgent = engine
        .submit(OrderRequest::new(line(), 10, [MATERIAL]).with_priority(5))
        .await
        .unwrap();
    settle().await;

    assert_eq!(engine.order(&first).await.unwrap().state, OrderState::Queued);
    assert_eq!(engine.order(&routine).await.unwrap().state, OrderState::Created);
    assert_eq!(engine.order(&urgent).await.unwrap().state, OrderState::Created);
    assert_eq!(engine.inventory()[0].reserved, 10);

    let cancelled = engine.cancel_order(&first).await.unwrap();
    assert_eq!(cancelled.state, OrderState::Cancelled);
    settle().await;

    assert_eq!(engine.order(&urgent).await.unwrap().state, OrderState::Queued);
    assert_eq!(engine.order(&routine).await.unwrap().state, OrderState::Created);
    let steel = &engine.inventory()[0];
    assert_eq!((steel.on_hand, steel.reserved), (90, 10));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn in_progress_order_cannot_be_cancelled() {
    let device = idle_device();
    let store = Arc::new(MemoryEventStore::new());
    let engine = start_engine(&device, store.clone()).await;
    let order_id = running_order(&device, &engine, 10).await;

    let err = engine.cancel_order(&order_id).await.unwrap_err();
    match err {
        MesError::InvalidTransition { from, attempted, .. } => {
            assert_eq!(from, "IN_PROGRESS");
            assert_eq!(attempted, "CANCELLED");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        engine.order(&order_id).await.unwrap().state,
        OrderState::InProgress
    );

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn refused_append_halts_the_order_until_the_log_recovers() {
    let device = idle_device();
    let store = Arc::new(MemoryEventStore::new());
    let engine = start_engine(&device, store.clone()).await;
    let order_id = running_order(&device, &engine, 10).await;

    store.fail_all(Some("disk full".into()));
    device.inject(COUNT, json!(1));
    settle().await;

    let order = engine.order(&order_id).await.unwrap();
    assert!(order.deferred);
    assert_eq!(order.produced, 0);
    let halted = AlarmCondition::PersistenceFailure {
        order_id: order_id.clone(),
    };
    assert!(engine
        .alarms()
        .await
        .iter()
        .any(|alarm| alarm.condition == halted));

    store.fail_all(None);
    settle().await;

    let order = engine.order(&order_id).await.unwrap();
    assert!(!order.deferred);
    assert_eq!(order.produced, 1);
    let unit_id = format!("{order_id}:4");
    let stored = store
        .records()
        .into_iter()
        .filter(|record| record.event_id == unit_id)
        .count();
    assert_eq!(stored, 1);
    assert!(!engine
        .alarms()
        .await
        .iter()
        .any(|alarm| alarm.condition == halted));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn line_fault_holds_orders_until_resumed() {
    let device = idle_device();
    let store = Arc::new(MemoryEventStore::new());
    let engine = start_engine(&device, store.clone()).await;
    let order_id = running_order(&device, &engine, 10).await;

    device.inject(FAULT, json!(true));
    settle().await;
    let order = engine.order(&order_id).await.unwrap();
    assert_eq!(order.state, OrderState::InProgress);
    assert_eq!(order.faulted, Some(FaultReason::LineFault));
    assert_eq!(engine.line_status(&line()).await.unwrap().mode, OperatingMode::Fault);

    // units counted while faulted wait for the resume
    device.inject(COUNT, json!(3));
    settle().await;
    assert_eq!(engine.order(&order_id).await.unwrap().produced, 0);

    let err = engine.resume_fault(&line()).await.unwrap_err();
    assert!(matches!(err, MesError::InvalidTransition { .. }));

    device.inject(FAULT, json!(false));
    settle().await;
    assert_eq!(
        engine.order(&order_id).await.unwrap().faulted,
        Some(FaultReason::LineFault)
    );

    let resumed = engine.resume_fault(&line()).await.unwrap();
    assert_eq!(resumed, vec![order_id.clone()]);
    let order = engine.order(&order_id).await.unwrap();
    assert_eq!(order.faulted, None);
    assert_eq!(order.produced, 3);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn missing_verdict_faults_the_order_and_raises_an_alarm() {
    let device = idle_device();
    let store = Arc::new(MemoryEventStore::new());
    let engine = start_engine(&device, store.clone()).await;
    let order_id = running_order(&device, &engine, 10).await;

    device.inject(COUNT, json!(5));
    settle().await;
    sleep(Duration::from_secs(31)).await;

    let order = engine.order(&order_id).await.unwrap();
    assert_eq!(order.state, OrderState::QualityCheck);
    assert_eq!(order.faulted, Some(FaultReason::VerdictTimeout));
    let timeout = AlarmCondition::VerdictTimeout {
        order_id: order_id.clone(),
    };
    assert!(engine
        .alarms()
        .await
        .iter()
        .any(|alarm| alarm.condition == timeout));

    // a late reading is held until the order is resumed
    device.inject(TEMPERATURE, json!(21.0));
    settle().await;
    assert_eq!(
        engine.order(&order_id).await.unwrap().state,
        OrderState::QualityCheck
    );

    engine.resume_fault(&line()).await.unwrap();
    let order = engine.order(&order_id).await.unwrap();
    assert_eq!(order.state, OrderState::InProgress);
    assert_eq!(order.faulted, None);
    assert!(!engine
        .alarms()
        .await
        .iter()
        .any(|alarm| alarm.condition == timeout));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn speed_commands_are_written_and_rejections_alarm() {
    let device = idle_device();
    let store = Arc::new(MemoryEventStore::new());
    let engine = start_engine(&device, store.clone()).await;
    let rejected = AlarmCondition::WriteRejected {
        signal: "c1.speed_setpoint".into(),
    };

    engine.set_line_speed(&line(), 1.5).await.unwrap();
    assert_eq!(device.value(&SETPOINT), Some(json!(1.5)));
    assert_eq!(
        engine.line_status(&line()).await.unwrap().speed_setpoint,
        Some(1.5)
    );

    device.reject_writes(Some("interlock engaged".into()));
    let err = engine.set_line_speed(&line(), 2.0).await.unwrap_err();
    assert!(matches!(err, MesError::WriteRejected { .. }));
    settle().await;
    assert!(alarm_active(&engine, &rejected).await);

    device.reject_writes(None);
    engine.set_line_speed(&line(), 2.0).await.unwrap();
    settle().await;
    assert!(!alarm_active(&engine, &rejected).await);

    // a rejection followed at once by an accepted write leaves nothing active
    device.reject_writes(Some("interlock engaged".into()));
    assert!(engine.set_line_speed(&line(), 2.5).await.is_err());
    device.reject_writes(None);
    engine.set_line_speed(&line(), 2.5).await.unwrap();
    settle().await;
    assert!(!alarm_active(&engine, &rejected).await);
    let raised = engine
        .alarm_history()
        .await
        .iter()
        .filter(|alarm| alarm.condition == rejected)
        .count();
    assert_eq!(raised, 2);

    let err = engine.set_line_speed(&line(), -1.0).await.unwrap_err();
    assert!(matches!(err, MesError::InvalidRequest(_)));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn over_threshold_reading_alarms_until_it_recovers() {
    let device = idle_device();
    let store = Arc::new(MemoryEventStore::new());
    let engine = start_engine(&device, store.clone()).await;
    let hot = AlarmCondition::OverThreshold {
        signal: "c1.temperature".into(),
    };

    device.inject(TEMPERATURE, json!(45.0));
    settle().await;
    let alarms = engine.alarms().await;
    let alarm = alarms.iter().find(|alarm| alarm.condition == hot).unwrap();
    assert!(alarm.message.contains("threshold 40.00"));

    device.inject(TEMPERATURE, json!(22.0));
    settle().await;
    assert!(!engine
        .alarms()
        .await
        .iter()
        .any(|alarm| alarm.condition == hot));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn restock_and_acknowledge_are_recorded() {
    let device = idle_device();
    let store = Arc::new(MemoryEventStore::new());
    let engine = start_engine(&device, store.clone()).await;

    let item = engine.restock(MATERIAL, 20).await.unwrap();
    assert_eq!(item.on_hand, 120);
    assert!(matches!(
        engine.restock("unobtainium", 5).await.unwrap_err(),
        MesError::UnknownMaterial(_)
    ));

    device.reject_writes(Some("interlock engaged".into()));
    let _ = engine.set_line_speed(&line(), 2.0).await;
    settle().await;
    let alarm = engine
        .alarms()
        .await
        .into_iter()
        .find(|alarm| matches!(alarm.condition, AlarmCondition::WriteRejected { .. }))
        .unwrap();
    let acknowledged = engine.acknowledge_alarm(&alarm.id).await.unwrap();
    assert!(acknowledged.is_acknowledged());
    assert!(acknowledged.is_active());

    settle().await;
    engine.refresh_read_model().await.unwrap();
    assert!(engine.with_read_model(|model| {
        model
            .alarms()
            .any(|stored| stored.id == alarm.id && stored.is_acknowledged())
    }));
    let events = engine.events_since(0, 100).await.unwrap();
    assert!(events
        .iter()
        .any(|record| record.event_id == format!("inventory/{MATERIAL}:1")));
    assert!(events.windows(2).all(|pair| pair[0].offset < pair[1].offset));

    engine.shutdown().await;
}

#[tokio::test]
async fn restart_restores_orders_and_stock_from_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let device = idle_device();

    let order_id = {
        let store = Arc::new(FileEventStore::open(&path, false).unwrap());
        let engine = start_engine(&device, store).await;
        let order_id = running_order(&device, &engine, 10).await;
        device.inject(COUNT, json!(3));
        settle().await;
        assert_eq!(engine.order(&order_id).await.unwrap().produced, 3);
        engine.shutdown().await;
        order_id
    };

    let store = Arc::new(FileEventStore::open(&path, false).unwrap());
    let engine = start_engine(&device, store).await;
    settle().await;

    let order = engine.order(&order_id).await.unwrap();
    assert_eq!(order.state, OrderState::InProgress);
    assert_eq!(order.produced, 3);
    let steel = &engine.inventory()[0];
    assert_eq!((steel.on_hand, steel.reserved), (90, 7));
    assert_eq!(
        engine.line_status(&line()).await.unwrap().assigned_order,
        Some(order_id.clone())
    );
    let view = engine.order_view(&order_id).unwrap();
    assert_eq!(view.produced, 3);

    // counting resumes from the restored position
    device.inject(COUNT, json!(4));
    settle().await;
    assert_eq!(engine.order(&order_id).await.unwrap().produced, 4);

    engine.shutdown().await;
}
