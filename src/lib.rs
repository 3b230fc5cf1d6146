//! fanbus - broker-backed local event bus
//!
//! Gives each process an event emitter whose events fan out through a shared
//! pub/sub topic to every other process using the same topic prefix. Each
//! application owns one queue subscribed to the topic; the bus provisions
//! topic, queue, access policy and subscription on first connect and then
//! long-polls the queue, dispatching received events to local handlers.
//!
//! ```ignore
//! use std::sync::Arc;
//! use fanbus::{BusOptions, EventBus, InMemoryBroker};
//!
//! let bus = EventBus::create("billing", Arc::new(InMemoryBroker::new()), BusOptions::default())?;
//! bus.on("user:created", |args| println!("{args:?}"));
//! bus.connect().await?;
//! bus.emit("user:created", vec![serde_json::json!({"id": 42})]);
//! ```

pub mod broker;
pub mod bus;
pub mod config;
pub mod envelope;
pub mod provision;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

pub use broker::{init_broker, Broker, BrokerError, BrokerOperation, InMemoryBroker};
#[cfg(feature = "sns-sqs")]
pub use broker::SnsSqsBroker;
pub use bus::{BusError, BusOptions, ConnectionState, EventBus, Signal};
pub use config::Config;
pub use envelope::Envelope;
pub use provision::{ApplicationId, Provisioner, Topology};
