//! End-to-end tests for the node messaging engine over the in-process broker.

use serde_json::{json, Value};
use skybus_node::channel::BROADCAST_CHANNEL;
use skybus_node::envelope;
use skybus_node::{
    IpcError, LogRecord, MemoryBroker, Node, NodeConfig, RouteOptions, State, Subscription,
    Transport, TransportError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn node(broker: &MemoryBroker, name: &str) -> Node {
    let config = NodeConfig {
        name: Some(name.to_string()),
        log_mirror: false,
        ..NodeConfig::default()
    };
    Node::new(config, Arc::new(broker.clone()))
}

/// Give the dispatch loops a moment to drain.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_broadcast_payload_round_trip() {
    let broker = MemoryBroker::new();
    let receiver = node(&broker, "receiver");
    let sender = node(&broker, "sender");

    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    receiver
        .register("sensor\\.gps", RouteOptions::default(), move |delivery| {
            sink.lock().unwrap().push(delivery.data);
            Ok(None)
        })
        .unwrap();

    receiver.start().await.unwrap();
    sender.start().await.unwrap();

    let payload = json!({"lat": 48.8584, "lon": 2.2945, "sats": 11});
    sender.send("sensor.gps", &payload).await.unwrap();
    settle().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.as_slice(), &[payload]);

    sender.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test]
async fn test_ping_pong_blocking_call() {
    let broker = MemoryBroker::new();
    let responder = node(&broker, "responder");
    let caller = node(&broker, "caller");

    responder
        .register("^ping$", RouteOptions::blocking(), |_| Ok(Some(json!("pong"))))
        .unwrap();

    responder.start().await.unwrap();
    caller.start().await.unwrap();

    let reply = caller
        .send_blocking(responder.id(), "ping", &Value::Null, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply, json!("pong"));

    caller.stop().await.unwrap();
    responder.stop().await.unwrap();
}

#[tokio::test]
async fn test_blocking_call_with_no_matching_route_times_out() {
    let broker = MemoryBroker::new();
    let responder = node(&broker, "responder");
    let caller = node(&broker, "caller");

    let invocations = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&invocations);
    responder
        .register("^known$", RouteOptions::blocking(), move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .unwrap();

    responder.start().await.unwrap();
    caller.start().await.unwrap();

    let started = Instant::now();
    let err = caller
        .send_blocking(
            responder.id(),
            "unknown",
            &Value::Null,
            Duration::from_millis(300),
        )
        .await
        .unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(300));
    match err {
        IpcError::Timeout { label, elapsed } => {
            assert_eq!(label, "unknown");
            assert!(elapsed >= Duration::from_millis(300));
        }
        other => panic!("Expected Timeout, got {other:?}"),
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    caller.stop().await.unwrap();
    responder.stop().await.unwrap();
}

#[tokio::test]
async fn test_blocking_call_to_self_is_rejected_immediately() {
    let broker = MemoryBroker::new();
    let solo = node(&broker, "solo");
    solo.register("^echo$", RouteOptions::blocking(), |d| Ok(Some(d.data)))
        .unwrap();
    solo.start().await.unwrap();

    let id = solo.id().clone();
    let started = Instant::now();
    let err = solo
        .send_blocking(&id, "echo", &Value::Null, Duration::from_secs(5))
        .await
        .unwrap_err();
    // Rejected before any wait, let alone the five-second deadline.
    assert!(started.elapsed() < Duration::from_millis(100));
    match err {
        IpcError::InvalidArgument(message) => assert!(message.contains("self")),
        other => panic!("Expected InvalidArgument, got {other:?}"),
    }

    solo.stop().await.unwrap();
}

#[tokio::test]
async fn test_overlapping_routes_fire_once_each_in_registration_order() {
    let broker = MemoryBroker::new();
    let receiver = node(&broker, "receiver");
    let sender = node(&broker, "sender");

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let first = Arc::clone(&order);
    let second = Arc::clone(&order);
    receiver
        .register("sensor\\..*", RouteOptions::default(), move |_| {
            first.lock().unwrap().push("wildcard");
            Ok(None)
        })
        .unwrap();
    receiver
        .register("sensor\\.gps", RouteOptions::default(), move |_| {
            second.lock().unwrap().push("exact");
            Ok(None)
        })
        .unwrap();

    receiver.start().await.unwrap();
    sender.start().await.unwrap();
    sender.send("sensor.gps", &json!(1)).await.unwrap();
    settle().await;

    assert_eq!(order.lock().unwrap().as_slice(), &["wildcard", "exact"]);

    sender.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test]
async fn test_send_outside_started_fails_without_transport_io() {
    let broker = MemoryBroker::new();
    let idle = node(&broker, "idle");
    let mut probe = broker.subscribe(BROADCAST_CHANNEL).await.unwrap();

    let err = idle.send("anything", &json!(1)).await.unwrap_err();
    assert!(matches!(err, IpcError::InvalidState { .. }));
    let err = idle
        .send_blocking(
            &"peer".into(),
            "anything",
            &Value::Null,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IpcError::InvalidState { .. }));

    // Nothing reached the broker.
    use tokio_stream::StreamExt;
    let nothing = tokio::time::timeout(Duration::from_millis(100), probe.next()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn test_stop_is_idempotent_and_send_fails_after_stop() {
    let broker = MemoryBroker::new();
    let n = node(&broker, "transient");
    assert_eq!(n.state(), State::Stopped);
    n.stop().await.unwrap();

    n.start().await.unwrap();
    assert_eq!(n.state(), State::Started);
    n.stop().await.unwrap();
    n.stop().await.unwrap();
    assert_eq!(n.state(), State::Stopped);

    let err = n.send("late", &json!(1)).await.unwrap_err();
    assert!(matches!(err, IpcError::InvalidState { .. }));
}

#[tokio::test]
async fn test_double_start_fails() {
    let broker = MemoryBroker::new();
    let n = node(&broker, "eager");
    n.start().await.unwrap();
    let err = n.start().await.unwrap_err();
    assert!(matches!(err, IpcError::InvalidState { .. }));
    n.stop().await.unwrap();
}

#[tokio::test]
async fn test_restart_retains_identity_and_routes() {
    let broker = MemoryBroker::new();
    let receiver = node(&broker, "phoenix");
    let sender = node(&broker, "sender");

    let hits = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&hits);
    receiver
        .register("^beat$", RouteOptions::default(), move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .unwrap();

    let id_before = receiver.id().clone();
    receiver.start().await.unwrap();
    receiver.stop().await.unwrap();
    receiver.start().await.unwrap();
    assert_eq!(receiver.id(), &id_before);

    sender.start().await.unwrap();
    sender.send("beat", &Value::Null).await.unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    sender.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test]
async fn test_late_reply_is_discarded_and_node_stays_usable() {
    let broker = MemoryBroker::new();
    let responder = node(&broker, "responder");
    let caller = node(&broker, "caller");

    // Slow blocking route on a worker so dispatch is never starved.
    responder
        .register(
            "^slow$",
            RouteOptions {
                block: true,
                concurrent: true,
                ..RouteOptions::default()
            },
            |_| {
                std::thread::sleep(Duration::from_millis(400));
                Ok(Some(json!("too late")))
            },
        )
        .unwrap();
    responder
        .register("^ping$", RouteOptions::blocking(), |_| Ok(Some(json!("pong"))))
        .unwrap();

    responder.start().await.unwrap();
    caller.start().await.unwrap();

    let err = caller
        .send_blocking(
            responder.id(),
            "slow",
            &Value::Null,
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IpcError::Timeout { .. }));

    // The reply lands well after the timeout removed the pending entry.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let reply = caller
        .send_blocking(responder.id(), "ping", &Value::Null, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply, json!("pong"));

    caller.stop().await.unwrap();
    responder.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_failure_is_isolated_and_forwarded() {
    let broker = MemoryBroker::new();
    let responder = node(&broker, "responder");
    let caller = node(&broker, "caller");

    let survivors = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&survivors);
    responder
        .register("^boom$", RouteOptions::blocking(), |_| {
            Err("actuator jammed".to_string())
        })
        .unwrap();
    // A sibling route for the same label keeps firing regardless.
    responder
        .register("^boom$", RouteOptions::default(), move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .unwrap();

    responder.start().await.unwrap();
    caller.start().await.unwrap();

    let err = caller
        .send_blocking(responder.id(), "boom", &Value::Null, Duration::from_secs(2))
        .await
        .unwrap_err();
    match err {
        IpcError::Handler { label, message } => {
            assert_eq!(label, "boom");
            assert!(message.contains("actuator jammed"));
        }
        other => panic!("Expected Handler, got {other:?}"),
    }
    settle().await;
    assert_eq!(survivors.load(Ordering::SeqCst), 1);

    caller.stop().await.unwrap();
    responder.stop().await.unwrap();
}

#[tokio::test]
async fn test_route_registered_while_running_applies_to_next_envelope() {
    let broker = MemoryBroker::new();
    let receiver = node(&broker, "receiver");
    let sender = node(&broker, "sender");

    receiver.start().await.unwrap();
    sender.start().await.unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    sender.send("live", &json!(1)).await.unwrap();
    settle().await;

    let count = Arc::clone(&hits);
    receiver
        .register("^live$", RouteOptions::default(), move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .unwrap();

    sender.send("live", &json!(2)).await.unwrap();
    settle().await;
    // Only the envelope sent after registration was delivered.
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    sender.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test]
async fn test_own_broadcasts_skipped_unless_loopback() {
    let broker = MemoryBroker::new();
    let n = node(&broker, "introspective");

    let hits = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&hits);
    n.register("^note$", RouteOptions::default(), move |_| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    })
    .unwrap();
    n.start().await.unwrap();

    n.send("note", &json!("ignored")).await.unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    n.send_loopback("note", &json!("heard")).await.unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    n.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_frame_is_dropped_not_fatal() {
    let broker = MemoryBroker::new();
    let responder = node(&broker, "responder");
    let caller = node(&broker, "caller");

    responder
        .register("^ping$", RouteOptions::blocking(), |_| Ok(Some(json!("pong"))))
        .unwrap();
    responder.start().await.unwrap();
    caller.start().await.unwrap();

    broker
        .publish(BROADCAST_CHANNEL, bytes::Bytes::from_static(b"not an envelope"))
        .await
        .unwrap();
    settle().await;

    // The dispatch loop survived the garbage.
    let reply = caller
        .send_blocking(responder.id(), "ping", &Value::Null, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply, json!("pong"));

    caller.stop().await.unwrap();
    responder.stop().await.unwrap();
}

#[tokio::test]
async fn test_log_records_are_observable_by_other_nodes() {
    let broker = MemoryBroker::new();
    let observer = Node::new(
        NodeConfig {
            name: Some("observer".to_string()),
            log_mirror: false,
            subscribe_logs: true,
            ..NodeConfig::default()
        },
        Arc::new(broker.clone()),
    );
    let chatty = node(&broker, "chatty");

    let records: Arc<Mutex<Vec<LogRecord>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&records);
    observer
        .register("log\\.INFO\\..*", RouteOptions { suppress_log: true, ..RouteOptions::default() }, move |delivery| {
            let record: LogRecord =
                serde_json::from_value(delivery.data).map_err(|e| e.to_string())?;
            sink.lock().unwrap().push(record);
            Ok(None)
        })
        .unwrap();

    observer.start().await.unwrap();
    chatty.start().await.unwrap();

    chatty.logger().info("motors armed");
    settle().await;

    let records = records.lock().unwrap();
    assert!(records
        .iter()
        .any(|r| r.message == "motors armed" && r.node.as_str() == "chatty"));

    chatty.stop().await.unwrap();
    observer.stop().await.unwrap();
}

#[tokio::test]
async fn test_panicking_handler_does_not_kill_dispatch_or_siblings() {
    let broker = MemoryBroker::new();
    let responder = node(&broker, "responder");
    let caller = node(&broker, "caller");

    responder
        .register("^boom$", RouteOptions::default(), |_| -> Result<Option<Value>, String> {
            panic!("handler blew up")
        })
        .unwrap();
    let survivors = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&survivors);
    responder
        .register("^boom$", RouteOptions::default(), move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .unwrap();
    responder
        .register("^ping$", RouteOptions::blocking(), |_| Ok(Some(json!("pong"))))
        .unwrap();

    responder.start().await.unwrap();
    caller.start().await.unwrap();

    caller.send("boom", &Value::Null).await.unwrap();
    settle().await;
    assert_eq!(survivors.load(Ordering::SeqCst), 1);

    // The dispatch loop outlived the panic.
    let reply = caller
        .send_blocking(responder.id(), "ping", &Value::Null, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply, json!("pong"));

    caller.stop().await.unwrap();
    responder.stop().await.unwrap();
}

#[tokio::test]
async fn test_panicking_blocking_handler_reports_failure_to_caller() {
    let broker = MemoryBroker::new();
    let responder = node(&broker, "responder");
    let caller = node(&broker, "caller");

    responder
        .register(
            "^boom$",
            RouteOptions::blocking(),
            |_| -> Result<Option<Value>, String> { panic!("handler blew up") },
        )
        .unwrap();
    responder.start().await.unwrap();
    caller.start().await.unwrap();

    let err = caller
        .send_blocking(responder.id(), "boom", &Value::Null, Duration::from_secs(2))
        .await
        .unwrap_err();
    match err {
        IpcError::Handler { message, .. } => assert!(message.contains("panicked")),
        other => panic!("Expected Handler, got {other:?}"),
    }

    caller.stop().await.unwrap();
    responder.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_stops_both_succeed() {
    let broker = MemoryBroker::new();
    let n = node(&broker, "contended");
    n.start().await.unwrap();

    let (a, b) = tokio::join!(n.stop(), n.stop());
    a.unwrap();
    b.unwrap();
    assert_eq!(n.state(), State::Stopped);
}

/// A transport whose subscriptions fail for one channel; publishes still work.
struct LameTransport {
    inner: MemoryBroker,
    dead_channel: String,
}

#[async_trait::async_trait]
impl Transport for LameTransport {
    async fn publish(&self, channel: &str, payload: bytes::Bytes) -> Result<(), TransportError> {
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        if channel == self.dead_channel {
            return Err(TransportError::Subscribe {
                channel: channel.to_string(),
                reason: "broker refused".to_string(),
            });
        }
        self.inner.subscribe(channel).await
    }
}

#[tokio::test]
async fn test_failed_start_emits_terminal_status() {
    let broker = MemoryBroker::new();
    let mut probe = broker.subscribe(BROADCAST_CHANNEL).await.unwrap();
    let lame = Node::new(
        NodeConfig {
            name: Some("lame".to_string()),
            log_mirror: false,
            ..NodeConfig::default()
        },
        Arc::new(LameTransport {
            inner: broker.clone(),
            dead_channel: BROADCAST_CHANNEL.to_string(),
        }),
    );

    let err = lame.start().await.unwrap_err();
    assert!(matches!(err, IpcError::Transport(_)));
    assert_eq!(lame.state(), State::Stopped);

    // Observers see the starting arc closed, not a node stuck starting.
    use tokio_stream::StreamExt;
    let mut labels = Vec::new();
    while let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_millis(200), probe.next()).await
    {
        labels.push(envelope::decode(&frame).unwrap().label);
    }
    assert_eq!(labels, vec!["status.lame.starting", "status.lame.stopped"]);
}

#[tokio::test]
async fn test_blocking_handler_returning_none_yields_null() {
    let broker = MemoryBroker::new();
    let responder = node(&broker, "responder");
    let caller = node(&broker, "caller");

    responder
        .register("^ack$", RouteOptions::blocking(), |_| Ok(None))
        .unwrap();
    responder.start().await.unwrap();
    caller.start().await.unwrap();

    let reply = caller
        .send_blocking(responder.id(), "ack", &Value::Null, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply, Value::Null);

    caller.stop().await.unwrap();
    responder.stop().await.unwrap();
}
