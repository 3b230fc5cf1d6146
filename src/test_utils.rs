//! Test utilities: recording handlers and bounded waits.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::bus::Signal;

/// Upper bound for any wait in unit tests.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Handler that forwards every invocation's arguments to a channel.
pub fn recording_handler() -> (
    impl Fn(&[Value]) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Vec<Value>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |args: &[Value]| {
        let _ = tx.send(args.to_vec());
    };
    (handler, rx)
}

/// Next recorded invocation, failing the test after `WAIT_TIMEOUT`.
pub async fn next_call(rx: &mut mpsc::UnboundedReceiver<Vec<Value>>) -> Vec<Value> {
    tokio::time::timeout(WAIT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for handler call")
        .expect("handler channel closed")
}

/// Next signal, failing the test after `WAIT_TIMEOUT`.
pub async fn next_signal(rx: &mut broadcast::Receiver<Signal>) -> Signal {
    tokio::time::timeout(WAIT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for signal")
        .expect("signal channel closed")
}

/// Poll `condition` until it holds, failing the test after `WAIT_TIMEOUT`.
pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}
