//! Queue consumer loop.
//!
//! One receive call at a time: long-poll, dispatch every message of the
//! batch in order, then acknowledge the batch with a single delete. A
//! message is only deleted after its handlers have run, so a crash between
//! dispatch and delete means redelivery (at-least-once).

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::registry::LocalEvents;
use super::{BusError, BusOptions};
use crate::broker::{Broker, BrokerError, BrokerOperation, DeleteEntry, ReceivedMessage};
use crate::envelope::Envelope;

/// Delay used if the backoff iterator ever runs dry.
const FALLBACK_DELAY: Duration = Duration::from_secs(30);

/// Receive parameters for the poll loop.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub max_messages: i32,
    pub wait_time_secs: i32,
    pub backoff: ExponentialBuilder,
}

impl From<&BusOptions> for PollSettings {
    fn from(options: &BusOptions) -> Self {
        Self {
            max_messages: options.batch_size(),
            wait_time_secs: options.wait_time(),
            backoff: options.backoff(),
        }
    }
}

/// Handle to a running poller.
pub struct PollerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Signal the poller to stop after its current step.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the poller and wait for it to exit.
    pub async fn join(self) {
        self.stop();
        if let Err(e) = self.task.await {
            error!(error = %e, "Queue poller task failed");
        }
    }
}

pub(crate) struct Poller {
    broker: Arc<dyn Broker>,
    queue_url: String,
    settings: PollSettings,
    events: LocalEvents,
}

impl Poller {
    pub(crate) fn new(
        broker: Arc<dyn Broker>,
        queue_url: impl Into<String>,
        settings: PollSettings,
        events: LocalEvents,
    ) -> Self {
        Self {
            broker,
            queue_url: queue_url.into(),
            settings,
            events,
        }
    }

    pub(crate) fn spawn(self) -> PollerHandle {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        PollerHandle { stop, task }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(queue_url = %self.queue_url, "Starting queue poller");
        let mut backoff = self.settings.backoff.build();

        loop {
            if *stop.borrow() {
                break;
            }

            let received = tokio::select! {
                biased;
                _ = stop.changed() => break,
                result = self.broker.receive_messages(
                    &self.queue_url,
                    self.settings.max_messages,
                    self.settings.wait_time_secs,
                ) => result,
            };

            match received {
                Ok(messages) => {
                    backoff = self.settings.backoff.build();
                    self.process_batch(messages).await;
                }
                Err(e) => {
                    let delay = backoff.next().unwrap_or(FALLBACK_DELAY);
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        queue_url = %self.queue_url,
                        "Failed to receive messages, retrying after backoff"
                    );
                    self.events.error(BusError::Receive(e));

                    tokio::select! {
                        biased;
                        _ = stop.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(queue_url = %self.queue_url, "Queue poller stopped");
    }

    /// Dispatch a batch in receive order, then delete all of it.
    async fn process_batch(&self, messages: Vec<ReceivedMessage>) {
        if messages.is_empty() {
            return;
        }
        debug!(count = messages.len(), "Received messages");

        for message in &messages {
            match Envelope::from_delivery(&message.body) {
                Ok(envelope) => {
                    let handled = self.events.dispatch(&envelope.event, &envelope.data);
                    debug!(
                        event = %envelope.event,
                        message_id = %message.message_id,
                        handlers = handled,
                        "Dispatched event"
                    );
                }
                Err(e) => {
                    // Still acknowledged below: a malformed body never decodes.
                    warn!(
                        error = %e,
                        message_id = %message.message_id,
                        "Discarding undecodable message"
                    );
                    self.events.error(BusError::Codec(e));
                }
            }
        }

        let entries = DeleteEntry::batch(&messages);
        match self
            .broker
            .delete_message_batch(&self.queue_url, entries)
            .await
        {
            Ok(outcome) if outcome.failed.is_empty() => {
                debug!(count = messages.len(), "Acknowledged messages");
            }
            Ok(outcome) => {
                let not_deleted: Vec<&str> = outcome
                    .failed
                    .iter()
                    .filter_map(|id| id.parse::<usize>().ok())
                    .filter_map(|index| messages.get(index))
                    .map(|m| m.message_id.as_str())
                    .collect();
                let err = BrokerError::request(
                    BrokerOperation::DeleteMessageBatch,
                    format!("messages not deleted: {}", not_deleted.join(", ")),
                );
                error!(error = %err, "Partial batch acknowledgment");
                self.events.error(BusError::Acknowledge(err));
            }
            Err(e) => {
                error!(error = %e, "Failed to acknowledge messages");
                self.events.error(BusError::Acknowledge(e));
            }
        }
    }
}
