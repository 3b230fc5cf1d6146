use std::time::Duration;

use serde_json::json;

use super::*;
use crate::broker::{BrokerOperation, InMemoryBroker};
use crate::test_utils::{next_call, next_signal, recording_handler, wait_until};

fn fast_options() -> BusOptions {
    BusOptions::default()
        .with_wait_time(1)
        .with_backoff(Duration::from_millis(5), Duration::from_millis(20))
}

fn bus_for(app: &str, broker: &Arc<InMemoryBroker>) -> EventBus {
    EventBus::create(app, broker.clone(), fast_options()).unwrap()
}

#[test]
fn test_create_rejects_invalid_application_id() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let err = EventBus::create("bad id!", broker.clone(), BusOptions::default())
        .err()
        .unwrap();
    assert!(matches!(err, BusError::InvalidApplicationId(_)));

    let too_long = "a".repeat(100);
    let err = EventBus::create(too_long, broker, BusOptions::default())
        .err()
        .unwrap();
    assert!(matches!(err, BusError::InvalidApplicationId(_)));
}

#[test]
fn test_from_config_requires_application_id() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let mut config = Config::for_test();
    assert!(EventBus::from_config(&config, broker.clone()).is_err());

    config.application_id = Some("orders".to_string());
    let bus = EventBus::from_config(&config, broker).unwrap();
    assert_eq!(bus.application_id().as_str(), "orders");
    assert_eq!(bus.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_emit_before_connect_raises_client_error() {
    let broker = Arc::new(InMemoryBroker::new());
    let bus = bus_for("app1", &broker);
    let (handler, mut calls) = recording_handler();
    bus.on(CLIENT_ERROR_EVENT, handler);
    let mut signals = bus.signals();

    bus.emit("user:created", vec![json!({"id": 42})]);

    assert_eq!(next_call(&mut calls).await, vec![json!("not connected to broker")]);
    assert!(matches!(
        next_signal(&mut signals).await,
        Signal::ClientError(ref msg) if msg == "not connected to broker"
    ));
    assert!(broker.journal().is_empty());
}

#[tokio::test]
async fn test_publish_before_connect_is_not_connected() {
    let broker = Arc::new(InMemoryBroker::new());
    let bus = bus_for("app1", &broker);
    let err = bus.publish("evt", vec![]).await.unwrap_err();
    assert!(matches!(err, BusError::NotConnected));
}

#[tokio::test]
async fn test_connect_emits_connection() {
    let broker = Arc::new(InMemoryBroker::new());
    let bus = bus_for("app1", &broker);
    let (handler, mut calls) = recording_handler();
    bus.on(CONNECTION_EVENT, handler);

    bus.connect().await.unwrap();

    assert_eq!(next_call(&mut calls).await, Vec::<Value>::new());
    assert_eq!(bus.state(), ConnectionState::Connected);
    let topology = bus.topology().unwrap();
    assert!(topology.topic_arn.ends_with(":fanbus-outgoing"));
    assert!(topology.queue_arn.ends_with(":fanbus-incoming-app1"));

    bus.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_does_not_reprovision() {
    let broker = Arc::new(InMemoryBroker::new());
    let bus = bus_for("app1", &broker);
    let mut signals = bus.signals();

    bus.connect().await.unwrap();
    let calls_after_first = broker.journal().len();
    bus.connect().await.unwrap();

    assert!(matches!(next_signal(&mut signals).await, Signal::Connected));
    assert!(matches!(next_signal(&mut signals).await, Signal::Connected));
    assert_eq!(broker.call_count(BrokerOperation::ListTopics), 1);
    assert_eq!(broker.call_count(BrokerOperation::CreateTopic), 1);
    assert!(broker.journal()[calls_after_first..]
        .iter()
        .all(|op| *op == BrokerOperation::ReceiveMessage));

    bus.shutdown().await;
}

#[tokio::test]
async fn test_provisioning_failure_emits_error_and_allows_retry() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.fail_next(BrokerOperation::Subscribe, 1);
    let bus = bus_for("app1", &broker);
    let (handler, mut errors) = recording_handler();
    bus.on(ERROR_EVENT, handler);
    let mut signals = bus.signals();

    let err = bus.connect().await.unwrap_err();
    assert!(matches!(err, BusError::Provisioning(ref e) if e.operation() == BrokerOperation::Subscribe));
    assert_eq!(bus.state(), ConnectionState::Disconnected);
    assert!(bus.topology().is_none());
    assert_eq!(next_call(&mut errors).await.len(), 1);
    assert!(matches!(
        next_signal(&mut signals).await,
        Signal::Error(BusError::Provisioning(_))
    ));

    bus.connect().await.unwrap();
    assert_eq!(bus.state(), ConnectionState::Connected);
    assert_eq!(broker.subscriptions("fanbus-outgoing").len(), 1);

    bus.shutdown().await;
}

#[tokio::test]
async fn test_emit_roundtrips_to_own_handlers() {
    let broker = Arc::new(InMemoryBroker::new());
    let bus = bus_for("app1", &broker);
    let (handler, mut calls) = recording_handler();
    bus.on("user:created", handler);

    bus.connect().await.unwrap();
    bus.emit("user:created", vec![json!({"id": 42}), json!("extra")]);

    assert_eq!(
        next_call(&mut calls).await,
        vec![json!({"id": 42}), json!("extra")]
    );

    bus.shutdown().await;
}

#[test]
fn test_on_keeps_duplicate_handlers() {
    let broker = Arc::new(InMemoryBroker::new());
    let bus = bus_for("app1", &broker);
    let noop = |_: &[serde_json::Value]| {};

    bus.on("tick", noop);
    bus.on("tick", noop);

    assert_eq!(bus.handler_count("tick"), 2);
    assert_eq!(bus.handler_count("tock"), 0);
    assert_eq!(bus.emit_local("tick", &[]), 2);
}

#[tokio::test]
async fn test_emit_local_skips_broker() {
    let broker = Arc::new(InMemoryBroker::new());
    let bus = bus_for("app1", &broker);
    let (handler, mut calls) = recording_handler();
    bus.on("tick", handler);

    assert_eq!(bus.emit_local("tick", &[json!(1)]), 1);
    assert_eq!(next_call(&mut calls).await, vec![json!(1)]);
    assert!(broker.journal().is_empty());
}

#[tokio::test]
async fn test_publish_failure_emits_error() {
    let broker = Arc::new(InMemoryBroker::new());
    let bus = bus_for("app1", &broker);
    bus.connect().await.unwrap();
    let mut signals = bus.signals();

    broker.fail_next(BrokerOperation::Publish, 1);
    bus.emit("evt", vec![]);

    assert!(matches!(
        next_signal(&mut signals).await,
        Signal::Error(BusError::Publish(_))
    ));
    assert_eq!(bus.state(), ConnectionState::Connected);

    bus.shutdown().await;
}

#[tokio::test]
async fn test_receive_failures_are_not_fatal() {
    let broker = Arc::new(InMemoryBroker::new());
    let bus = bus_for("app1", &broker);
    let (handler, mut calls) = recording_handler();
    bus.on("evt", handler);
    let mut signals = bus.signals();

    broker.fail_next(BrokerOperation::ReceiveMessage, 3);
    bus.connect().await.unwrap();
    assert!(matches!(next_signal(&mut signals).await, Signal::Connected));
    for _ in 0..3 {
        assert!(matches!(
            next_signal(&mut signals).await,
            Signal::Error(BusError::Receive(_))
        ));
    }

    bus.emit("evt", vec![json!("after")]);
    assert_eq!(next_call(&mut calls).await, vec![json!("after")]);

    bus.shutdown().await;
}

#[tokio::test]
async fn test_handler_runs_before_acknowledge() {
    let broker = Arc::new(InMemoryBroker::new());
    let bus = bus_for("app1", &broker);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    {
        let broker = broker.clone();
        bus.on("evt", move |_: &[Value]| {
            let _ = tx.send(broker.in_flight_count("fanbus-incoming-app1"));
        });
    }

    bus.connect().await.unwrap();
    bus.emit("evt", vec![]);

    let in_flight = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(in_flight, 1);
    wait_until(|| broker.in_flight_count("fanbus-incoming-app1") == 0).await;

    bus.shutdown().await;
}

#[tokio::test]
async fn test_undecodable_message_reported_and_acknowledged() {
    let broker = Arc::new(InMemoryBroker::new());
    let bus = bus_for("app1", &broker);
    bus.connect().await.unwrap();
    let mut signals = bus.signals();

    assert!(broker.send_raw("fanbus-incoming-app1", r#"{"Type":"Notification"}"#));

    assert!(matches!(
        next_signal(&mut signals).await,
        Signal::Error(BusError::Codec(_))
    ));
    wait_until(|| broker.in_flight_count("fanbus-incoming-app1") == 0).await;
    assert_eq!(broker.visible_count("fanbus-incoming-app1"), 0);

    bus.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_polling_and_closes() {
    let broker = Arc::new(InMemoryBroker::new());
    let bus = bus_for("app1", &broker);
    bus.connect().await.unwrap();
    wait_until(|| broker.call_count(BrokerOperation::ReceiveMessage) >= 1).await;

    tokio::time::timeout(Duration::from_secs(2), bus.shutdown())
        .await
        .unwrap();
    assert_eq!(bus.state(), ConnectionState::Closed);

    let receives = broker.call_count(BrokerOperation::ReceiveMessage);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.call_count(BrokerOperation::ReceiveMessage), receives);

    let mut signals = bus.signals();
    bus.emit("evt", vec![]);
    assert!(matches!(
        next_signal(&mut signals).await,
        Signal::ClientError(_)
    ));
    assert!(matches!(bus.connect().await, Err(BusError::Closed)));
}

#[tokio::test]
async fn test_concurrent_connect_is_rejected() {
    let broker = Arc::new(InMemoryBroker::new());
    let bus = bus_for("app1", &broker);
    let other = bus.clone();

    let (first, second) = tokio::join!(bus.connect(), other.connect());

    // The first poll of `join!` takes the connect; the second sees it in flight.
    assert!(first.is_ok());
    assert!(matches!(second, Err(BusError::AlreadyConnecting)));
    assert_eq!(bus.state(), ConnectionState::Connected);

    bus.shutdown().await;
}

#[tokio::test]
async fn test_dropped_connect_resets_state() {
    let broker = Arc::new(InMemoryBroker::new());
    let bus = bus_for("app1", &broker);

    {
        let connect = bus.connect();
        tokio::pin!(connect);
        // Poll once so the attempt registers, then drop it.
        let _ = futures::poll!(connect.as_mut());
    }

    assert_eq!(bus.state(), ConnectionState::Disconnected);
    bus.connect().await.unwrap();
    bus.shutdown().await;
}
