//! Local event bus backed by a remote broker.
//!
//! This module contains:
//! - `EventBus`: handler registry, connection lifecycle, outward emit
//! - `Publisher`: local emit to broker publish
//! - `PollerHandle`: the running queue consumer
//! - `BusError` and the reserved local events

mod options;
mod poller;
mod publisher;
mod registry;

pub use options::BusOptions;
pub use poller::{PollSettings, PollerHandle};
pub use publisher::Publisher;
pub use registry::{
    Handler, HandlerRegistry, Signal, CLIENT_ERROR_EVENT, CONNECTION_EVENT, ERROR_EVENT,
};

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::broker::{Broker, BrokerError};
use crate::config::Config;
use crate::envelope::CodecError;
use crate::provision::{ApplicationId, InvalidApplicationId, Provisioner, Topology};

use poller::Poller;
use registry::LocalEvents;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors surfaced by the bus, both as return values and as `error` events.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("Provisioning failed: {0}")]
    Provisioning(BrokerError),

    #[error("Publish failed: {0}")]
    Publish(BrokerError),

    #[error("Receive failed: {0}")]
    Receive(BrokerError),

    #[error("Acknowledge failed: {0}")]
    Acknowledge(BrokerError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    InvalidApplicationId(#[from] InvalidApplicationId),

    #[error("not connected to broker")]
    NotConnected,

    #[error("Connect already in progress")]
    AlreadyConnecting,

    #[error("Event bus is closed")]
    Closed,
}

/// Connection lifecycle of an `EventBus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal; set by `shutdown`.
    Closed,
}

/// State bound by the first successful connect.
struct Session {
    topology: Topology,
    publisher: Publisher,
    runtime: Handle,
}

struct Inner {
    application_id: ApplicationId,
    broker: Arc<dyn Broker>,
    options: BusOptions,
    events: LocalEvents,
    state: Mutex<ConnectionState>,
    session: OnceLock<Session>,
    poller: Mutex<Option<PollerHandle>>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Resets a connect that did not finish back to `Disconnected`.
struct ConnectAttempt<'a> {
    inner: &'a Inner,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Disconnected;
        }
    }
}

/// Event emitter whose outward events travel through the broker.
///
/// Handlers registered with `on` receive events published by every
/// application on the same topic prefix, including this one. Cloning is
/// cheap; clones share one connection.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Create a disconnected bus for `application_id`.
    pub fn create(
        application_id: impl Into<String>,
        broker: Arc<dyn Broker>,
        options: BusOptions,
    ) -> Result<Self> {
        let application_id = ApplicationId::new(application_id)?;
        options.resource_names().checked_queue_name(&application_id)?;

        let registry = Arc::new(HandlerRegistry::new());
        let events = LocalEvents::new(registry, options.signal_capacity);

        Ok(Self {
            inner: Arc::new(Inner {
                application_id,
                broker,
                options,
                events,
                state: Mutex::new(ConnectionState::Disconnected),
                session: OnceLock::new(),
                poller: Mutex::new(None),
            }),
        })
    }

    /// Create a bus from loaded configuration.
    pub fn from_config(config: &Config, broker: Arc<dyn Broker>) -> Result<Self> {
        let application_id = config.application_id.clone().unwrap_or_default();
        Self::create(application_id, broker, config.bus.clone())
    }

    /// Register a handler for `event`.
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.inner.events.registry().register(event, Arc::new(handler));
    }

    /// Publish an event to every connected application.
    ///
    /// Returns immediately. Publish failures arrive as `error` events; use
    /// before connect raises `clientError` and sends nothing.
    pub fn emit(&self, event: &str, args: Vec<Value>) {
        let session = match self.live_session() {
            Ok(session) => session,
            Err(e) => {
                warn!(event = %event, error = %e, "Emit on unconnected bus");
                self.inner.events.client_error(&e.to_string());
                return;
            }
        };

        let publisher = session.publisher.clone();
        let events = self.inner.events.clone();
        let event = event.to_string();
        session.runtime.spawn(async move {
            if let Err(e) = publisher.publish(&event, args).await {
                events.error(e);
            }
        });
    }

    /// Publish an event and wait for the broker to accept it.
    ///
    /// Unlike `emit`, failures are returned and not raised as events.
    pub async fn publish(&self, event: &str, args: Vec<Value>) -> Result<String> {
        let session = self.live_session()?;
        session.publisher.publish(event, args).await
    }

    /// Dispatch to local handlers only. Returns how many handlers ran.
    pub fn emit_local(&self, event: &str, args: &[Value]) -> usize {
        self.inner.events.dispatch(event, args)
    }

    /// Provision broker resources, bind publishing and start polling.
    ///
    /// Raises exactly one `connection` or `error` event and returns the same
    /// outcome. Connecting an already connected bus raises `connection`
    /// without touching the broker.
    pub async fn connect(&self) -> Result<()> {
        let result = self.establish().await;
        match &result {
            Ok(()) => self.inner.events.connected(),
            Err(e) => self.inner.events.error(e.clone()),
        }
        result
    }

    async fn establish(&self) -> Result<()> {
        let inner = &*self.inner;
        {
            let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => return Err(BusError::AlreadyConnecting),
                ConnectionState::Closed => return Err(BusError::Closed),
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
            }
        }
        let _attempt = ConnectAttempt { inner };

        info!(application_id = %inner.application_id, "Connecting event bus");
        let provisioner = Provisioner::new(inner.broker.clone(), inner.options.resource_names());
        let topology = provisioner
            .provision(&inner.application_id)
            .await
            .map_err(BusError::Provisioning)?;

        let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == ConnectionState::Closed {
            return Err(BusError::Closed);
        }

        let session = inner.session.get_or_init(|| Session {
            publisher: Publisher::new(inner.broker.clone(), topology.topic_arn.as_str()),
            runtime: Handle::current(),
            topology,
        });

        let handle = Poller::new(
            inner.broker.clone(),
            session.topology.queue_url.as_str(),
            PollSettings::from(&inner.options),
            inner.events.clone(),
        )
        .spawn();
        *inner.poller.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        *state = ConnectionState::Connected;

        info!(
            application_id = %inner.application_id,
            topic_arn = %session.topology.topic_arn,
            queue_url = %session.topology.queue_url,
            "Event bus connected"
        );
        Ok(())
    }

    /// Stop the poller and close the bus. Further emits raise `clientError`
    /// and further connects fail with `Closed`.
    pub async fn shutdown(&self) {
        self.inner.set_state(ConnectionState::Closed);
        let handle = self
            .inner
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            handle.join().await;
        }
        info!(application_id = %self.inner.application_id, "Event bus shut down");
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Provisioned resources, once connected.
    pub fn topology(&self) -> Option<Topology> {
        self.inner.session.get().map(|s| s.topology.clone())
    }

    pub fn application_id(&self) -> &ApplicationId {
        &self.inner.application_id
    }

    /// Typed stream of `connection`, `error` and `clientError` events.
    pub fn signals(&self) -> broadcast::Receiver<Signal> {
        self.inner.events.subscribe()
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.inner.events.registry().handler_count(event)
    }

    fn live_session(&self) -> Result<&Session> {
        match self.inner.state() {
            ConnectionState::Connected => self.inner.session.get().ok_or(BusError::NotConnected),
            ConnectionState::Closed => Err(BusError::Closed),
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                Err(BusError::NotConnected)
            }
        }
    }
}

#[cfg(test)]
mod tests;
