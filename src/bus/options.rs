//! Bus and poller settings.

use std::time::Duration;

use backon::ExponentialBuilder;
use serde::Deserialize;

use crate::broker::{MAX_RECEIVE_BATCH, MAX_WAIT_TIME_SECS};
use crate::provision::{ResourceNames, DEFAULT_PREFIX};
use crate::utils::retry::poll_backoff;

/// Settings accepted by `EventBus::create`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusOptions {
    /// Prefix for the topic and queue names (default: "fanbus").
    pub topic_prefix: String,
    /// Long-poll wait per receive call, in seconds (default: 10).
    pub wait_time_secs: i32,
    /// Messages per receive call (default: 10, at most 10).
    pub max_messages: i32,
    /// First delay after a failed receive, in milliseconds (default: 100).
    pub backoff_min_ms: u64,
    /// Largest delay between failed receives, in milliseconds (default: 30000).
    pub backoff_max_ms: u64,
    /// Buffered signals per `signals()` receiver (default: 256).
    pub signal_capacity: usize,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_PREFIX.to_string(),
            wait_time_secs: 10,
            max_messages: MAX_RECEIVE_BATCH,
            backoff_min_ms: 100,
            backoff_max_ms: 30_000,
            signal_capacity: 256,
        }
    }
}

impl BusOptions {
    /// Set topic/queue name prefix.
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    /// Set long-poll wait in seconds.
    pub fn with_wait_time(mut self, secs: i32) -> Self {
        self.wait_time_secs = secs;
        self
    }

    /// Set receive batch size.
    pub fn with_max_messages(mut self, max: i32) -> Self {
        self.max_messages = max;
        self
    }

    /// Set receive-failure backoff bounds.
    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min_ms = u64::try_from(min.as_millis()).unwrap_or(u64::MAX);
        self.backoff_max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn resource_names(&self) -> ResourceNames {
        ResourceNames::new(&self.topic_prefix)
    }

    /// Batch size clamped to what one receive call may return.
    pub fn batch_size(&self) -> i32 {
        self.max_messages.clamp(1, MAX_RECEIVE_BATCH)
    }

    pub fn wait_time(&self) -> i32 {
        self.wait_time_secs.clamp(0, MAX_WAIT_TIME_SECS)
    }

    pub fn backoff(&self) -> ExponentialBuilder {
        poll_backoff(
            Duration::from_millis(self.backoff_min_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = BusOptions::default();
        assert_eq!(options.topic_prefix, "fanbus");
        assert_eq!(options.wait_time_secs, 10);
        assert_eq!(options.max_messages, 10);
    }

    #[test]
    fn test_batch_size_is_clamped() {
        assert_eq!(BusOptions::default().with_max_messages(50).batch_size(), 10);
        assert_eq!(BusOptions::default().with_max_messages(0).batch_size(), 1);
        assert_eq!(BusOptions::default().with_max_messages(4).batch_size(), 4);
    }

    #[test]
    fn test_wait_time_is_clamped() {
        assert_eq!(BusOptions::default().with_wait_time(60).wait_time(), 20);
        assert_eq!(BusOptions::default().with_wait_time(-1).wait_time(), 0);
    }

    #[test]
    fn test_resource_names_follow_prefix() {
        let names = BusOptions::default().with_topic_prefix("shop").resource_names();
        assert_eq!(names.prefix(), "shop");
        assert_eq!(names.topic_name(), "shop-outgoing");
    }

    #[test]
    fn test_backoff_bounds_saturate() {
        let options = BusOptions::default().with_backoff(Duration::from_millis(250), Duration::MAX);
        assert_eq!(options.backoff_min_ms, 250);
        assert_eq!(options.backoff_max_ms, u64::MAX);
    }
}
