//! Envelope codec.
//!
//! A published message is the JSON of `{"event": .., "data": [..]}`. The
//! broker delivers it inside its own notification document whose `Message`
//! field carries that JSON as a string, so receiving decodes twice.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Notification type the broker stamps on fan-out deliveries.
pub const NOTIFICATION_TYPE: &str = "Notification";

/// Errors from encoding or decoding envelopes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to encode envelope: {0}")]
    Encode(String),

    #[error("Malformed delivery notification: {0}")]
    Notification(String),

    #[error("Malformed envelope: {0}")]
    Envelope(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Application-level event carried through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default, deserialize_with = "positional_args")]
    pub data: Vec<Value>,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Publish payload.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Decode a publish payload (the inner layer).
    pub fn decode(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| CodecError::Envelope(e.to_string()))
    }

    /// Decode a queue message body (notification, then envelope).
    pub fn from_delivery(body: &str) -> Result<Self> {
        let notification: Notification =
            serde_json::from_str(body).map_err(|e| CodecError::Notification(e.to_string()))?;
        Self::decode(&notification.message)
    }
}

/// A non-array `data` is a single argument; `null` is none.
fn positional_args<'de, D>(deserializer: D) -> std::result::Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    })
}

/// Broker delivery wrapper around a published payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Notification {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub topic_arn: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Notification {
    pub fn new(
        message_id: impl Into<String>,
        topic_arn: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: NOTIFICATION_TYPE.to_string(),
            message_id: message_id.into(),
            topic_arn: topic_arn.into(),
            message: message.into(),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    pub fn to_body(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CodecError::Encode(e.to_string()))
    }
}
