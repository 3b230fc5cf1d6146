//! Shared utilities for integration tests.
//!
//! Provides recording handlers and bounded waits for driving an `EventBus`.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fanbus::{Broker, BusOptions, EventBus, Signal};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

/// Upper bound for any single wait.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Options tuned for tests: short long-poll and fast backoff.
///
/// Also installs the log subscriber (`FANBUS_LOG=debug` for bus traces).
pub fn test_options() -> BusOptions {
    fanbus::utils::bootstrap::init_tracing();
    BusOptions::default()
        .with_wait_time(1)
        .with_backoff(Duration::from_millis(10), Duration::from_millis(200))
}

/// Bus with a recording handler already attached to `event`.
pub fn recording_bus(
    app: &str,
    broker: Arc<dyn Broker>,
    options: BusOptions,
    event: &str,
) -> (EventBus, mpsc::UnboundedReceiver<Vec<Value>>) {
    let bus = EventBus::create(app, broker, options).expect("valid application id");
    let (tx, rx) = mpsc::unbounded_channel();
    bus.on(event, move |args: &[Value]| {
        let _ = tx.send(args.to_vec());
    });
    (bus, rx)
}

/// Next recorded call, panicking after `WAIT_TIMEOUT`.
pub async fn next_call(rx: &mut mpsc::UnboundedReceiver<Vec<Value>>) -> Vec<Value> {
    tokio::time::timeout(WAIT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("handler channel closed")
}

/// Assert nothing arrives within `window`.
pub async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Vec<Value>>, window: Duration) {
    if let Ok(Some(call)) = tokio::time::timeout(window, rx.recv()).await {
        panic!("unexpected event delivered: {call:?}");
    }
}

/// Next signal, panicking after `WAIT_TIMEOUT`.
pub async fn next_signal(rx: &mut broadcast::Receiver<Signal>) -> Signal {
    tokio::time::timeout(WAIT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for signal")
        .expect("signal channel closed")
}
