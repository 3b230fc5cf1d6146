//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff between failed receive calls in the queue poller.
///
/// Unbounded attempt count; the delay grows from `min_delay` and caps at
/// `max_delay`. Jitter enabled.
pub fn poll_backoff(min_delay: Duration, max_delay: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(max_delay.max(min_delay))
        .without_max_times()
        .with_jitter()
}
