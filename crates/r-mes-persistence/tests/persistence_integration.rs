//! ---
//! mes_section: "03-persistence-logging"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Durable event sink and read model."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use prometheus::Registry;
use r_mes_common::{AlarmCondition, InventoryItem, LineId, OrderId, OrderState};
use r_mes_persistence::{
    AlarmAcknowledged, AlarmCleared, DomainEvent, EventKind, FileEventStore, InventoryAdjusted,
    MemoryEventStore, NewEvent, OrderCreated, OrderTransitioned, PersistenceMetrics,
    PersistenceSink, ReadModel, ALARM_SUBJECT,
};
use tempfile::tempdir;

fn order_created(order: &str) -> NewEvent {
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

fn queued(order: &str) -> NewEvent {
    NewEvent::new(
        2,
        DomainEvent::OrderTransitioned(OrderTransitioned {
            order_id: OrderId::from(order),
            line: LineId::from("C1"),
            from: OrderState::Created,
            to: OrderState::Queued,
            produced: 0,
            rework_count: 0,
            at: Utc::now(),
        }),
    )
}

fn stock(item: &InventoryItem, sequence: u64) -> NewEvent {
    NewEvent::new(
        sequence,
        DomainEvent::InventoryAdjusted(InventoryAdjusted {
            material: item.material.clone(),
            on_hand: item.on_hand,
            reserved: item.reserved,
            delta: -10,
            reason: "reserve".into(),
            order_id: None,
        }),
    )
}

#[tokio::test]
async fn file_sink_reads_since_cursor_in_append_order() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("events.log");
    let sink = PersistenceSink::new(Arc::new(FileEventStore::open(&path, true).unwrap()), None);

    let a = sink.append(order_created("PO_A")).await.unwrap();
    let b = sink.append(order_created("PO_B")).await.unwrap();
    let c = sink.append(queued("PO_A")).await.unwrap();
    assert_eq!((a.offset, b.offset, c.offset), (1, 2, 3));
    assert_eq!(c.event_id, "PO_A:2");

    let after_first = sink.read_since(1, 100).await.unwrap();
    let offsets: Vec<u64> = after_first.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![2, 3]);
    assert!(sink.read_since(3, 100).await.unwrap().is_empty());
    assert_eq!(sink.read_since(0, 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn reopened_log_continues_and_replays_idempotently() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("events.log");
    {
        let sink = PersistenceSink::new(Arc::new(FileEventStore::open(&path, true).unwrap()), None);
        sink.append(order_created("PO_A")).await.unwrap();
        sink.append(queued("PO_A")).await.unwrap();
    }

    let sink = PersistenceSink::new(Arc::new(FileEventStore::open(&path, true).unwrap()), None);
    // crash between durable write and acknowledgement: the producer re-sends
    let duplicate = sink.append(queued("PO_A")).await.unwrap();
    assert_eq!(duplicate.offset, 3);

    let item = InventoryItem {
        material: "steel-casing".into(),
        on_hand: 90,
        reserved: 10,
        reorder_threshold: 10,
        per_unit: 1,
    };
    sink.append(stock(&item, 1)).await.unwrap();

    let mut model = ReadModel::new();
    let applied = sink.catch_up(&mut model).await.unwrap();
    assert_eq!(applied, 3);
    assert_eq!(model.cursor(), 4);

    let order = model.order(&OrderId::from("PO_A")).unwrap();
    assert_eq!(order.state, OrderState::Queued);
    assert_eq!(model.inventory("steel-casing").unwrap().on_hand, 90);
    assert_eq!(model.next_sequence("PO_A"), 3);

    let mut fresh = ReadModel::new();
    for record in sink.read_since(0, 100).await.unwrap() {
        fresh.apply(&record);
        fresh.apply(&record);
    }
    assert_eq!(fresh.order(&OrderId::from("PO_A")), model.order(&OrderId::from("PO_A")));
}

#[tokio::test]
async fn alarm_lifecycle_events_share_one_sequence() {
    let sink = PersistenceSink::new(Arc::new(MemoryEventStore::new()), None);
    let cleared = sink
        .append(NewEvent::new(
            1,
            DomainEvent::AlarmCleared(AlarmCleared {
                alarm_id: "ALM-1".into(),
                condition: AlarmCondition::PersistenceBackpressure,
                cleared_at: Utc::now(),
            }),
        ))
        .await
        .unwrap();
    let acknowledged = sink
        .append(NewEvent::new(
            2,
            DomainEvent::AlarmAcknowledged(AlarmAcknowledged {
                alarm_id: "ALM-1".into(),
                acknowledged_at: Utc::now(),
            }),
        ))
        .await
        .unwrap();
    assert_eq!(cleared.subject, ALARM_SUBJECT);
    assert_eq!(acknowledged.event_id, format!("{ALARM_SUBJECT}:2"));

    let mut model = ReadModel::new();
    sink.catch_up(&mut model).await.unwrap();
    assert_eq!(model.next_sequence(ALARM_SUBJECT), 3);
}

#[tokio::test]
async fn failed_appends_are_not_acknowledged() {
    let store = Arc::new(MemoryEventStore::new());
    let registry = Arc::new(Registry::new());
    let metrics = PersistenceMetrics::new(registry.clone()).unwrap();
    let sink = PersistenceSink::new(store.clone(), Some(metrics));

    store.fail_next(1);
    assert!(sink.append(order_created("PO_A")).await.is_err());
    assert!(store.is_empty());

    let record = sink.append(order_created("PO_A")).await.unwrap();
    assert_eq!(record.offset, 1);
    assert_eq!(record.kind, EventKind::OrderCreated);

    let families = registry.gather();
    let failures = families
        .iter()
        .find(|family| family.get_name() == "r_mes_event_append_failures_total")
        .unwrap();
    assert_eq!(failures.get_metric()[0].get_counter().get_value(), 1.0);
}

#[tokio::test(start_paused = true)]
async fn write_latency_tracks_slow_store() {
    let store = Arc::new(MemoryEventStore::new());
    let sink = PersistenceSink::new(store.clone(), None);
    store.set_latency(Duration::from_millis(400));
    for index in 0..10 {
        sink.append(order_created(&format!("PO_{index}"))).await.unwrap();
    }
    assert!(sink.write_latency() >= Duration::from_millis(350));

    store.set_latency(Duration::ZERO);
    for index in 10..40 {
        sink.append(order_created(&format!("PO_{index}"))).await.unwrap();
    }
    assert!(sink.write_latency() < Duration::from_millis(50));
}
