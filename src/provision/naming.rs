//! Resource naming.
//!
//! Topic: `{prefix}-outgoing` (one per account).
//! Queue: `{prefix}-incoming-{application_id}` (one per application).

use std::fmt;

/// Longest queue name the broker accepts.
pub const MAX_QUEUE_NAME_LEN: usize = 80;

/// Default resource name prefix.
pub const DEFAULT_PREFIX: &str = "fanbus";

/// Rejected application id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid application id {id:?}: {reason}")]
pub struct InvalidApplicationId {
    pub id: String,
    pub reason: &'static str,
}

/// Opaque identifier of a consuming application.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApplicationId(String);

impl ApplicationId {
    /// Ids end up in queue names, so only `[A-Za-z0-9_-]` is allowed.
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidApplicationId> {
        let id = id.into();
        if id.is_empty() {
            return Err(InvalidApplicationId {
                id,
                reason: "must not be empty",
            });
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(InvalidApplicationId {
                id,
                reason: "only ASCII letters, digits, '-' and '_' are allowed",
            });
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives broker resource names from a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    prefix: String,
}

impl Default for ResourceNames {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl ResourceNames {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The shared outgoing topic.
    pub fn topic_name(&self) -> String {
        format!("{}-outgoing", self.prefix)
    }

    /// The application's incoming queue.
    pub fn queue_name(&self, application_id: &ApplicationId) -> String {
        format!("{}-incoming-{}", self.prefix, application_id)
    }

    /// `queue_name`, rejecting names the broker would refuse.
    pub fn checked_queue_name(
        &self,
        application_id: &ApplicationId,
    ) -> Result<String, InvalidApplicationId> {
        let name = self.queue_name(application_id);
        if name.len() > MAX_QUEUE_NAME_LEN {
            return Err(InvalidApplicationId {
                id: application_id.to_string(),
                reason: "derived queue name exceeds 80 characters",
            });
        }
        Ok(name)
    }
}
