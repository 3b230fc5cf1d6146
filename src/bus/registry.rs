//! Local handler registry and the bus's own lifecycle events.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{error, warn};

use super::BusError;

/// Emitted once per successful `connect`.
pub const CONNECTION_EVENT: &str = "connection";
/// Emitted for provisioning, publish, receive, decode and acknowledge failures.
pub const ERROR_EVENT: &str = "error";
/// Emitted when the bus is used before it is connected.
pub const CLIENT_ERROR_EVENT: &str = "clientError";

/// Callback invoked with an event's positional arguments.
pub type Handler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Event name to handlers, in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler; registering the same handler twice invokes it twice.
    pub fn register(&self, event: impl Into<String>, handler: Handler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.into())
            .or_default()
            .push(handler);
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Invoke every handler for `event`, returning how many ran.
    ///
    /// Handlers run outside the registry lock, so they may register more
    /// handlers; those take effect from the next dispatch.
    pub fn dispatch(&self, event: &str, args: &[Value]) -> usize {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .cloned()
            .unwrap_or_default();

        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(args))).is_err() {
                error!(event = %event, "Event handler panicked");
            }
        }
        handlers.len()
    }
}

/// Typed mirror of the bus's reserved events.
#[derive(Debug, Clone)]
pub enum Signal {
    Connected,
    Error(BusError),
    ClientError(String),
}

/// Dispatches reserved events to local handlers and to signal receivers.
#[derive(Clone)]
pub(crate) struct LocalEvents {
    registry: Arc<HandlerRegistry>,
    signals: broadcast::Sender<Signal>,
}

impl LocalEvents {
    pub(crate) fn new(registry: Arc<HandlerRegistry>, capacity: usize) -> Self {
        let (signals, _) = broadcast::channel(capacity.max(1));
        Self { registry, signals }
    }

    pub(crate) fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    pub(crate) fn dispatch(&self, event: &str, args: &[Value]) -> usize {
        self.registry.dispatch(event, args)
    }

    pub(crate) fn connected(&self) {
        self.registry.dispatch(CONNECTION_EVENT, &[]);
        let _ = self.signals.send(Signal::Connected);
    }

    pub(crate) fn error(&self, err: BusError) {
        if self.registry.handler_count(ERROR_EVENT) == 0 {
            warn!(error = %err, "Bus error with no error handler registered");
        }
        self.registry
            .dispatch(ERROR_EVENT, &[Value::String(err.to_string())]);
        let _ = self.signals.send(Signal::Error(err));
    }

    pub(crate) fn client_error(&self, message: &str) {
        self.registry
            .dispatch(CLIENT_ERROR_EVENT, &[Value::String(message.to_string())]);
        let _ = self.signals.send(Signal::ClientError(message.to_string()));
    }
}
