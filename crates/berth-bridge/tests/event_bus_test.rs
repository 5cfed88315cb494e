use berth_bridge::event_bus::EventBus;
use berth_bridge::protocol::{
    AppEvent, ContainerStatusPayload, EventType, HeartbeatPayload, SseMessage,
};

#[test]
fn new_bus_has_no_subscribers() {
    let bus = EventBus::new();
    assert_eq!(bus.subscriber_count(), 0);
}

#[test]
fn publish_delivers_to_every_subscriber() {
    let bus = EventBus::new();
    let subs: Vec<_> = (0..3).map(|_| bus.subscribe()).collect();

    assert_eq!(bus.publish(AppEvent::output("pulling layer")), 3);

    for sub in &subs {
        let msg = sub.rx.try_recv().expect("should receive message");
        assert_eq!(msg.event.event_type, EventType::OrchestrationOutput);
        assert_eq!(msg.event.payload["line"], "pulling layer");
    }
}

#[test]
fn messages_keep_publish_order() {
    let bus = EventBus::new();
    let sub = bus.subscribe();

    bus.publish(AppEvent::phase("pulling", "Pulling image"));
    bus.publish(AppEvent::output("line 1"));
    bus.publish(AppEvent::phase("starting", "Starting container"));

    let types: Vec<_> = sub.rx.try_iter().map(|m| m.event.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::OrchestrationPhase,
            EventType::OrchestrationOutput,
            EventType::OrchestrationPhase
        ]
    );
}

#[test]
fn dropped_receiver_is_pruned() {
    let bus = EventBus::new();
    let first = bus.subscribe();
    let second = bus.subscribe();
    drop(first);

    assert_eq!(bus.publish(AppEvent::output("x")), 1);
    assert_eq!(bus.subscriber_count(), 1);
    assert!(second.rx.try_recv().is_ok());
}

#[test]
fn unsubscribe_removes_client() {
    let bus = EventBus::new();
    let sub = bus.subscribe();
    bus.unsubscribe(sub.id);
    assert_eq!(bus.subscriber_count(), 0);
}

#[test]
fn full_buffer_drops_for_that_client_only() {
    let bus = EventBus::with_client_buffer(2);
    let slow = bus.subscribe();
    let fast = bus.subscribe();

    bus.publish(AppEvent::output("1"));
    bus.publish(AppEvent::output("2"));
    assert!(fast.rx.try_recv().is_ok());
    assert!(fast.rx.try_recv().is_ok());

    // slow is full now; fast drained
    assert_eq!(bus.publish(AppEvent::output("3")), 1);
    assert_eq!(bus.subscriber_count(), 2, "full subscribers are kept");
    assert_eq!(slow.rx.len(), 2);
    assert_eq!(fast.rx.try_recv().unwrap().event.payload["line"], "3");
}

#[test]
fn no_delivery_before_subscription() {
    let bus = EventBus::new();
    bus.publish(AppEvent::output("early"));
    let sub = bus.subscribe();
    assert!(sub.rx.try_recv().is_err());
}

#[test]
fn envelope_is_stamped() {
    let bus = EventBus::new();
    let sub = bus.subscribe();
    bus.publish(AppEvent::output("a"));
    bus.publish(AppEvent::output("b"));
    let a = sub.rx.try_recv().unwrap();
    let b = sub.rx.try_recv().unwrap();
    assert_ne!(a.id, b.id);
    assert!(a.timestamp > 0);
}

#[test]
fn current_status_tracks_last_container_status() {
    let bus = EventBus::new();
    let initial: ContainerStatusPayload = bus.current_status().payload_as().unwrap();
    assert_eq!(initial.status, "running");

    bus.publish(AppEvent::container_status("stopped", Some("exited".into())));
    let latest: ContainerStatusPayload = bus.current_status().payload_as().unwrap();
    assert_eq!(latest.status, "stopped");
    assert_eq!(latest.message.as_deref(), Some("exited"));
}

#[test]
fn heartbeat_payload_shape() {
    let bus = EventBus::new();
    let sub = bus.subscribe();
    bus.heartbeat();
    let msg = sub.rx.try_recv().unwrap();
    assert_eq!(msg.event.event_type, EventType::Heartbeat);
    let payload: HeartbeatPayload = msg.event.payload_as().unwrap();
    assert!(payload.timestamp > 0);
    assert!(payload.uptime >= 0);
}

#[test]
fn wire_format_uses_colon_type_names() {
    let msg = SseMessage::new(AppEvent::cache_invalidated("wt-1", "head changed"));
    let json: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
    assert_eq!(json["event"]["type"], "cache:invalidated");
    assert_eq!(json["event"]["payload"]["worktreeId"], "wt-1");
    assert!(json["id"].is_string());
    assert!(json["timestamp"].is_i64());

    for ty in [
        EventType::PortMapped,
        EventType::WorktreeBatchUpdated,
        EventType::NotificationShow,
    ] {
        let encoded = serde_json::to_value(ty).unwrap();
        assert_eq!(encoded, ty.as_str());
    }
}

#[tokio::test]
async fn heartbeat_task_stops_on_shutdown() {
    let bus = EventBus::new();
    let sub = bus.subscribe();
    let shutdown = berth_harness::ShutdownSignal::new();
    let handle = bus.spawn_heartbeat(std::time::Duration::from_millis(10), shutdown.clone());

    let msg = tokio::time::timeout(std::time::Duration::from_secs(2), sub.rx.recv_async())
        .await
        .expect("heartbeat arrives")
        .unwrap();
    assert_eq!(msg.event.event_type, EventType::Heartbeat);

    shutdown.trigger();
    let stopped = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
        .await
        .expect("task exits")
        .unwrap();
    assert_eq!(stopped, Some(()));
}
