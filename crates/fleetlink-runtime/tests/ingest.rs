mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{DEVICE, Harness, ctx, state};
use fleetlink_middleware::Topic;
use fleetlink_runtime::{PresenceProvider as _, RawOrder};
use fleetlink_types::{
    Action, BlockingType, ConnectionState, ConnectionStatus, Event, EventPayload, Node,
    OrderStatus, Verdict,
};
use serde_json::json;

fn beep(id: &str) -> Vec<Action> {
    vec![Action::new("beep", id, BlockingType::None)]
}

fn connection(device: &str, status: ConnectionStatus) -> ConnectionState {
    ConnectionState {
        header_id: 1,
        timestamp: None,
        manufacturer: "acme".to_string(),
        serial_number: device.to_string(),
        connection_state: status,
    }
}

#[tokio::test]
async fn finished_actions_complete_the_command_exactly_once() {
    let h = Harness::new();
    let ingestor = h.ingestor();
    let sent = h
        .engine
        .execute_instant_actions(&ctx(), DEVICE, beep("beep-1"), "beep twice", None)
        .await
        .unwrap();

    let running = state(DEVICE, "", &[("beep-1", "RUNNING")]);
    assert!(ingestor.handle_state(&running).await.is_empty());
    assert_eq!(h.store.get(&sent.order_id).await.unwrap().status, OrderStatus::Sent);

    let finished = state(DEVICE, "", &[("beep-1", "FINISHED")]);
    let results = ingestor.handle_state(&finished).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].verdict, Verdict::Success);
    assert_eq!(results[0].command_text, "beep twice");
    assert_eq!(
        h.store.get(&sent.order_id).await.unwrap().status,
        OrderStatus::Completed
    );
    assert!(h.engine.pending().is_empty());

    let failed_later = state(DEVICE, "", &[("beep-1", "FAILED")]);
    assert!(ingestor.handle_state(&failed_later).await.is_empty());
    assert_eq!(
        h.store.get(&sent.order_id).await.unwrap().status,
        OrderStatus::Completed
    );
}

#[tokio::test]
async fn failed_action_fails_the_record_with_the_robot_reason() {
    let h = Harness::new();
    let ingestor = h.ingestor();
    let sent = h
        .engine
        .execute_instant_actions(&ctx(), DEVICE, beep("lift-1"), "lift", None)
        .await
        .unwrap();

    let mut report = state(DEVICE, "", &[("lift-1", "FAILED")]);
    report.action_states[0].result_description = Some("load too heavy".to_string());
    let results = ingestor.handle_state(&report).await;

    assert_eq!(results[0].verdict, Verdict::Failure);
    let record = h.store.get(&sent.order_id).await.unwrap();
    assert_eq!(record.status, OrderStatus::Failed);
    assert_eq!(
        record.error_message.as_deref(),
        Some("action lift-1 failed: load too heavy")
    );
}

#[tokio::test]
async fn state_for_another_device_settles_nothing() {
    let h = Harness::new();
    let ingestor = h.ingestor();
    h.engine
        .execute_instant_actions(&ctx(), DEVICE, beep("beep-1"), "beep", None)
        .await
        .unwrap();

    let other = state("agv-02", "", &[("beep-1", "FINISHED")]);
    assert!(ingestor.handle_state(&other).await.is_empty());
    assert_eq!(h.engine.pending().len(), 1);
}

#[tokio::test]
async fn raw_order_is_correlated_by_order_id() {
    let h = Harness::new();
    let ingestor = h.ingestor();
    let order = RawOrder {
        order_id: "ext-7".to_string(),
        order_update_id: 0,
        nodes: vec![Node {
            node_id: "A".to_string(),
            sequence_id: 0,
            released: true,
            node_position: None,
            actions: Vec::new(),
        }],
        edges: Vec::new(),
    };
    h.engine
        .execute_raw_order(&ctx(), DEVICE, order, "go to A", None)
        .await
        .unwrap();

    let done = state(DEVICE, "ext-7", &[("robot-side-1", "FINISHED")]);
    let results = ingestor.handle_state(&done).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].correlation_key, "ext-7");
    assert_eq!(h.store.get("ext-7").await.unwrap().status, OrderStatus::Completed);
}

#[tokio::test]
async fn status_updates_are_deduplicated() {
    let h = Harness::new();
    let ingestor = h.ingestor();
    let mut updates = h.bus.subscribe_to(Topic::StatusUpdates);

    let idle = state(DEVICE, "", &[]);
    ingestor.handle_state(&idle).await;
    ingestor.handle_state(&idle).await;
    let mut driving = idle.clone();
    driving.driving = true;
    ingestor.handle_state(&driving).await;

    let mut seen = Vec::new();
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(50), updates.recv()).await
    {
        match event.payload {
            EventPayload::DeviceStatusChanged { device_id, status } => {
                assert_eq!(device_id, DEVICE);
                seen.push(status.driving);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
    assert_eq!(seen, vec![false, true]);
}

#[tokio::test]
async fn going_offline_fails_only_that_devices_commands() {
    let h = Harness::new();
    let ingestor = h.ingestor();
    h.presence.set_online("agv-02", Some("acme"));
    let mine = h
        .engine
        .execute_instant_actions(&ctx(), DEVICE, beep("beep-1"), "beep", None)
        .await
        .unwrap();
    let theirs = h
        .engine
        .execute_instant_actions(&ctx(), "agv-02", beep("beep-2"), "beep", None)
        .await
        .unwrap();

    let results = ingestor
        .handle_connection(&connection(DEVICE, ConnectionStatus::ConnectionBroken))
        .await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].correlation_key, mine.order_id);
    assert!(!h.presence.is_online(DEVICE));

    assert_eq!(
        h.store.get(&mine.order_id).await.unwrap().status,
        OrderStatus::Failed
    );
    assert_eq!(
        h.store.get(&theirs.order_id).await.unwrap().status,
        OrderStatus::Sent
    );
    assert!(h.engine.pending().find(&theirs.order_id).is_some());
}

#[tokio::test]
async fn online_connection_fails_nothing() {
    let h = Harness::new();
    let ingestor = h.ingestor();
    h.engine
        .execute_instant_actions(&ctx(), DEVICE, beep("beep-1"), "beep", None)
        .await
        .unwrap();
    let results = ingestor
        .handle_connection(&connection(DEVICE, ConnectionStatus::Online))
        .await;
    assert!(results.is_empty());
    assert_eq!(h.engine.pending().len(), 1);
}

#[tokio::test]
async fn factsheet_manufacturer_is_used_for_later_destinations() {
    let h = Harness::new();
    let ingestor = h.ingestor();
    ingestor.handle_factsheet(DEVICE, &json!({ "manufacturer": "robotco" }));

    let sent = h.engine.request_factsheet(&ctx(), DEVICE, None).await.unwrap();
    assert_eq!(sent.destination, "uagv/v2/robotco/agv-01/instantActions");
    assert_eq!(h.transport.payload(0)["manufacturer"], "robotco");
}

#[tokio::test]
async fn spawned_ingestor_reports_results_on_the_bus() {
    let h = Harness::new();
    let mut results = h.bus.subscribe_to(Topic::CommandResults);
    let task = Arc::new(h.ingestor()).spawn();

    let sent = h
        .engine
        .execute_instant_actions(&ctx(), DEVICE, beep("beep-1"), "beep", None)
        .await
        .unwrap();
    h.bus.publish_to(
        Topic::Telemetry,
        Event::new(
            "test",
            EventPayload::DeviceState(state(DEVICE, "", &[("beep-1", "FINISHED")])),
        ),
    );

    let event = tokio::time::timeout(Duration::from_secs(2), results.recv())
        .await
        .expect("no command result within 2s")
        .unwrap();
    match event.payload {
        EventPayload::CommandResult(result) => {
            assert_eq!(result.correlation_key, sent.order_id);
            assert_eq!(result.verdict, Verdict::Success);
        }
        other => panic!("unexpected payload: {other:?}"),
    }
    task.abort();
}

#[tokio::test]
async fn spawned_ingestor_handles_connection_topic() {
    let h = Harness::new();
    let task = Arc::new(h.ingestor()).spawn();
    let sent = h.engine.request_factsheet(&ctx(), DEVICE, None).await.unwrap();

    h.bus.publish_to(
        Topic::Connection,
        Event::new(
            "test",
            EventPayload::Connection(connection(DEVICE, ConnectionStatus::Offline)),
        ),
    );

    let mut status = OrderStatus::Sent;
    for _ in 0..40 {
        status = h.store.get(&sent.order_id).await.unwrap().status;
        if status == OrderStatus::Failed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(status, OrderStatus::Failed);
    task.abort();
}

#[tokio::test]
async fn rate_limiter_throttles_status_changes() {
    let h = Harness::new();
    let limiter = Arc::new(fleetlink_kernel::RateLimiter::new(
        Duration::from_secs(60),
        Duration::from_secs(120),
    ));
    let ingestor = h.ingestor().with_rate_limiter(limiter);
    let mut updates = h.bus.subscribe_to(Topic::StatusUpdates);

    let idle = state(DEVICE, "", &[]);
    ingestor.handle_state(&idle).await;
    let mut driving = idle.clone();
    driving.driving = true;
    ingestor.handle_state(&driving).await;

    let first = updates.recv().await.unwrap();
    assert!(matches!(
        first.payload,
        EventPayload::DeviceStatusChanged { ref status, .. } if !status.driving
    ));
    assert!(
        tokio::time::timeout(Duration::from_millis(50), updates.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn throttled_status_change_is_delivered_once_the_interval_passes() {
    let h = Harness::new();
    let limiter = Arc::new(fleetlink_kernel::RateLimiter::new(
        Duration::from_millis(50),
        Duration::from_secs(5),
    ));
    let ingestor = h.ingestor().with_rate_limiter(limiter);
    let mut updates = h.bus.subscribe_to(Topic::StatusUpdates);

    let idle = state(DEVICE, "", &[]);
    ingestor.handle_state(&idle).await;
    let mut driving = idle.clone();
    driving.driving = true;
    ingestor.handle_state(&driving).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    ingestor.handle_state(&driving).await;

    let first = updates.recv().await.unwrap();
    assert!(matches!(
        first.payload,
        EventPayload::DeviceStatusChanged { ref status, .. } if !status.driving
    ));
    let second = tokio::time::timeout(Duration::from_millis(200), updates.recv())
        .await
        .expect("throttled change never delivered")
        .unwrap();
    assert!(matches!(
        second.payload,
        EventPayload::DeviceStatusChanged { ref status, .. } if status.driving
    ));
}

#[tokio::test]
async fn offline_device_is_forgotten_by_the_rate_limiter() {
    let h = Harness::new();
    let limiter = Arc::new(fleetlink_kernel::RateLimiter::new(
        Duration::from_secs(60),
        Duration::from_secs(120),
    ));
    let ingestor = h.ingestor().with_rate_limiter(Arc::clone(&limiter));

    ingestor.handle_state(&state(DEVICE, "", &[])).await;
    assert_eq!(limiter.len(), 1);

    ingestor
        .handle_connection(&connection(DEVICE, ConnectionStatus::Offline))
        .await;
    assert!(limiter.is_empty());
}

#[tokio::test]
async fn partially_reported_instant_actions_keep_the_record_sent() {
    let h = Harness::new();
    let ingestor = h.ingestor();
    let actions = vec![
        Action::new("beep", "a1", BlockingType::None),
        Action::new("lift", "a2", BlockingType::None),
    ];
    let sent = h
        .engine
        .execute_instant_actions(&ctx(), DEVICE, actions, "beep then lift", None)
        .await
        .unwrap();

    let first_only = state(DEVICE, "", &[("a1", "FINISHED")]);
    assert!(ingestor.handle_state(&first_only).await.is_empty());
    assert_eq!(h.store.get(&sent.order_id).await.unwrap().status, OrderStatus::Sent);

    let second_failed = state(DEVICE, "", &[("a1", "FINISHED"), ("a2", "FAILED")]);
    let results = ingestor.handle_state(&second_failed).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].verdict, Verdict::Failure);
    assert_eq!(h.store.get(&sent.order_id).await.unwrap().status, OrderStatus::Failed);
}
