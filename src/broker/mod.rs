//! Broker contract for topic fan-out.
//!
//! This module contains:
//! - `Broker` trait: the fixed set of topic/queue/subscription operations the
//!   bus consumes
//! - Wire-level record types returned by those operations
//! - Implementations: AWS SNS/SQS, in-memory emulation

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{BrokerConfig, BrokerType};

// Implementation modules
pub mod memory;
#[cfg(feature = "sns-sqs")]
pub mod sns_sqs;

// Re-exports
pub use memory::InMemoryBroker;
#[cfg(feature = "sns-sqs")]
pub use sns_sqs::SnsSqsBroker;

/// Largest batch a single receive call may return.
pub const MAX_RECEIVE_BATCH: i32 = 10;

/// Longest long-poll wait the broker accepts, in seconds.
pub const MAX_WAIT_TIME_SECS: i32 = 20;

/// Subscription protocol for queue endpoints.
pub const SQS_PROTOCOL: &str = "sqs";

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Broker operations, used for error reporting and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOperation {
    ListTopics,
    CreateTopic,
    CreateQueue,
    GetQueueAttributes,
    SetQueueAttributes,
    Subscribe,
    GetSubscriptionAttributes,
    ListSubscriptionsByTopic,
    GetQueueUrl,
    Publish,
    ReceiveMessage,
    DeleteMessageBatch,
}

impl BrokerOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListTopics => "ListTopics",
            Self::CreateTopic => "CreateTopic",
            Self::CreateQueue => "CreateQueue",
            Self::GetQueueAttributes => "GetQueueAttributes",
            Self::SetQueueAttributes => "SetQueueAttributes",
            Self::Subscribe => "Subscribe",
            Self::GetSubscriptionAttributes => "GetSubscriptionAttributes",
            Self::ListSubscriptionsByTopic => "ListSubscriptionsByTopic",
            Self::GetQueueUrl => "GetQueueUrl",
            Self::Publish => "Publish",
            Self::ReceiveMessage => "ReceiveMessage",
            Self::DeleteMessageBatch => "DeleteMessageBatch",
        }
    }
}

impl fmt::Display for BrokerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by broker calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("{operation} failed: {message}")]
    Request {
        operation: BrokerOperation,
        message: String,
    },

    #[error("{operation} response is missing {field}")]
    MissingField {
        operation: BrokerOperation,
        field: &'static str,
    },

    #[error("{operation}: no such resource {resource}")]
    NotFound {
        operation: BrokerOperation,
        resource: String,
    },
}

impl BrokerError {
    pub fn request(operation: BrokerOperation, message: impl fmt::Display) -> Self {
        Self::Request {
            operation,
            message: message.to_string(),
        }
    }

    pub fn missing(operation: BrokerOperation, field: &'static str) -> Self {
        Self::MissingField { operation, field }
    }

    pub fn not_found(operation: BrokerOperation, resource: impl Into<String>) -> Self {
        Self::NotFound {
            operation,
            resource: resource.into(),
        }
    }

    /// The operation that failed.
    pub fn operation(&self) -> BrokerOperation {
        match self {
            Self::Request { operation, .. }
            | Self::MissingField { operation, .. }
            | Self::NotFound { operation, .. } => *operation,
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// A topic subscription as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub subscription_arn: String,
    pub topic_arn: String,
    pub protocol: String,
    /// For queue subscriptions, the queue ARN.
    pub endpoint: String,
    pub owner: Option<String>,
}

/// A message pulled from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

/// One acknowledgement in a batch delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteEntry {
    /// Batch-local id, echoed back for failed entries.
    pub id: String,
    pub receipt_handle: String,
}

impl DeleteEntry {
    /// Entries acknowledging `messages`, keyed by position in the batch.
    ///
    /// A standard queue may hand out the same message twice in one receive,
    /// and batch ids must be distinct, so message ids cannot be used.
    pub fn batch(messages: &[ReceivedMessage]) -> Vec<Self> {
        messages
            .iter()
            .enumerate()
            .map(|(index, message)| Self {
                id: index.to_string(),
                receipt_handle: message.receipt_handle.clone(),
            })
            .collect()
    }
}

/// Per-entry outcome of a batch delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteBatchOutcome {
    /// Ids of entries the broker did not delete.
    pub failed: Vec<String>,
}

/// Last `:`-delimited segment of an ARN (the resource name).
pub fn trailing_segment(arn: &str) -> &str {
    arn.rsplit(':').next().unwrap_or(arn)
}

// ============================================================================
// Trait
// ============================================================================

/// Topic/queue broker operations consumed by the bus.
///
/// Implementations:
/// - `SnsSqsBroker`: AWS SNS topics fanning out to SQS queues
/// - `InMemoryBroker`: in-process emulation with the same semantics
#[async_trait]
pub trait Broker: Send + Sync {
    /// ARNs of every topic in the account (all pages).
    async fn list_topics(&self) -> Result<Vec<String>>;

    /// Create a topic, or return the existing one's ARN.
    async fn create_topic(&self, name: &str) -> Result<String>;

    /// Create a queue, or return the existing one's URL.
    async fn create_queue(&self, name: &str) -> Result<String>;

    /// GetQueueAttributes for the `QueueArn` attribute.
    async fn get_queue_arn(&self, queue_url: &str) -> Result<String>;

    /// SetQueueAttributes for the `Policy` attribute.
    async fn set_queue_policy(&self, queue_url: &str, policy: &str) -> Result<()>;

    /// Subscribe a queue to a topic, returning the subscription ARN.
    async fn subscribe(&self, topic_arn: &str, queue_arn: &str) -> Result<String>;

    async fn get_subscription_attributes(
        &self,
        subscription_arn: &str,
    ) -> Result<SubscriptionRecord>;

    /// Every subscription on a topic (all pages).
    async fn list_subscriptions_by_topic(&self, topic_arn: &str)
        -> Result<Vec<SubscriptionRecord>>;

    async fn get_queue_url(&self, queue_name: &str) -> Result<String>;

    /// Publish a message to a topic, returning the broker message id.
    async fn publish(&self, topic_arn: &str, message: &str) -> Result<String>;

    /// Long-poll a queue for up to `max_messages` messages.
    async fn receive_messages(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_secs: i32,
    ) -> Result<Vec<ReceivedMessage>>;

    /// Acknowledge received messages in one call.
    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteEntry>,
    ) -> Result<DeleteBatchOutcome>;
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize a broker client based on configuration.
///
/// Requires the corresponding feature to be enabled:
/// - SNS/SQS: `--features sns-sqs`
/// - Memory: always available; each call creates an independent broker
pub async fn init_broker(
    config: &BrokerConfig,
) -> std::result::Result<Arc<dyn Broker>, Box<dyn std::error::Error + Send + Sync>> {
    match config.broker_type {
        BrokerType::Memory => {
            info!(broker_type = "memory", "Broker initialized");
            Ok(Arc::new(InMemoryBroker::new()))
        }
        BrokerType::SnsSqs => {
            #[cfg(feature = "sns-sqs")]
            {
                let broker = SnsSqsBroker::new(&config.sns_sqs).await;
                info!(broker_type = "sns-sqs", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "sns-sqs"))]
            {
                Err("SNS/SQS support requires the 'sns-sqs' feature. Rebuild with --features sns-sqs"
                    .into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_segment() {
        assert_eq!(
            trailing_segment("arn:aws:sns:us-east-1:000000000000:fanbus-outgoing"),
            "fanbus-outgoing"
        );
        assert_eq!(trailing_segment("no-colons"), "no-colons");
        assert_eq!(trailing_segment("ends-with:"), "");
    }

    #[test]
    fn test_broker_error_display() {
        let err = BrokerError::request(BrokerOperation::Publish, "throttled");
        assert_eq!(err.to_string(), "Publish failed: throttled");
        assert_eq!(err.operation(), BrokerOperation::Publish);

        let err = BrokerError::missing(BrokerOperation::CreateTopic, "TopicArn");
        assert_eq!(err.to_string(), "CreateTopic response is missing TopicArn");
    }

    #[test]
    fn test_delete_entries_use_batch_positions() {
        let message = |receipt: &str| ReceivedMessage {
            message_id: "m-1".to_string(),
            receipt_handle: receipt.to_string(),
            body: "{}".to_string(),
        };
        // Same message delivered twice in one receive.
        let entries = DeleteEntry::batch(&[message("r-1"), message("r-2")]);

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "0");
        assert_eq!(entries[1].id, "1");
        assert_eq!(entries[1].receipt_handle, "r-2");
    }

    #[tokio::test]
    async fn test_init_memory_broker() {
        let config = BrokerConfig::default();
        let broker = init_broker(&config).await.unwrap();
        assert!(broker.list_topics().await.unwrap().is_empty());
    }

    #[cfg(not(feature = "sns-sqs"))]
    #[tokio::test]
    async fn test_init_sns_sqs_requires_feature() {
        let config = BrokerConfig {
            broker_type: BrokerType::SnsSqs,
            ..Default::default()
        };
        assert!(init_broker(&config).await.is_err());
    }
}
