//! Outward publishing to the shared topic.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::BusError;
use crate::broker::Broker;
use crate::envelope::Envelope;

/// Publishes envelopes to the provisioned topic.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    topic_arn: Arc<str>,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, topic_arn: impl Into<Arc<str>>) -> Self {
        Self {
            broker,
            topic_arn: topic_arn.into(),
        }
    }

    pub fn topic_arn(&self) -> &str {
        &self.topic_arn
    }

    /// Publish one event, returning the broker's message id.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(event = %event))]
    pub async fn publish(&self, event: &str, args: Vec<Value>) -> Result<String, BusError> {
        let payload = Envelope::new(event, args).encode()?;

        let message_id = self
            .broker
            .publish(&self.topic_arn, &payload)
            .await
            .map_err(BusError::Publish)?;

        debug!(
            topic_arn = %self.topic_arn,
            message_id = %message_id,
            "Published event to topic"
        );
        Ok(message_id)
    }
}
