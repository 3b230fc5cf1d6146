//! In-memory broker emulating SNS topics fanning out to SQS queues.
//!
//! Used for standalone mode and tests. Mirrors the behaviors the bus relies
//! on: idempotent create calls, notification wrapping on fan-out, queue
//! policies gating delivery, long polling, receipt handles and batch deletes.
//! Fault injection and a call journal let tests drive failure paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{
    trailing_segment, Broker, BrokerError, BrokerOperation, DeleteBatchOutcome, DeleteEntry,
    ReceivedMessage, Result, SubscriptionRecord, MAX_RECEIVE_BATCH, MAX_WAIT_TIME_SECS,
    SQS_PROTOCOL,
};
use crate::envelope::Notification;

const REGION: &str = "us-east-1";
const ACCOUNT_ID: &str = "000000000000";
const QUEUE_ENDPOINT: &str = "http://localhost:4566";

struct StoredMessage {
    message_id: String,
    body: String,
}

struct TopicState {
    name: String,
    arn: String,
    subscriptions: Vec<SubscriptionRecord>,
}

struct QueueState {
    arn: String,
    url: String,
    policy: Option<String>,
    visible: VecDeque<StoredMessage>,
    /// Received but not yet deleted, keyed by receipt handle.
    in_flight: Vec<(String, StoredMessage)>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn take_visible(&mut self, max: usize) -> Vec<ReceivedMessage> {
        let count = max.min(self.visible.len());
        self.visible
            .drain(..count)
            .collect::<Vec<_>>()
            .into_iter()
            .map(|message| {
                let receipt_handle = Uuid::new_v4().to_string();
                let received = ReceivedMessage {
                    message_id: message.message_id.clone(),
                    receipt_handle: receipt_handle.clone(),
                    body: message.body.clone(),
                };
                self.in_flight.push((receipt_handle, message));
                received
            })
            .collect()
    }

    fn deliver(&mut self, message: StoredMessage) {
        self.visible.push_back(message);
        self.notify.notify_one();
    }
}

#[derive(Default)]
struct BrokerState {
    /// Creation order is listing order.
    topics: Vec<TopicState>,
    queues: HashMap<String, QueueState>,
    journal: Vec<(BrokerOperation, Instant)>,
    failures: HashMap<BrokerOperation, usize>,
}

impl BrokerState {
    fn topic_by_arn_mut(&mut self, arn: &str) -> Option<&mut TopicState> {
        self.topics.iter_mut().find(|t| t.arn == arn)
    }

    fn queue_by_url_mut(&mut self, url: &str) -> Option<&mut QueueState> {
        let name = url.rsplit('/').next().unwrap_or(url);
        self.queues.get_mut(name).filter(|q| q.url == url)
    }

    fn queue_by_arn_mut(&mut self, arn: &str) -> Option<&mut QueueState> {
        self.queues
            .get_mut(trailing_segment(arn))
            .filter(|q| q.arn == arn)
    }
}

/// In-process SNS/SQS emulation.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the call and consume an injected failure, if any.
    ///
    /// Yields first, so every call is a suspension point like a network
    /// round trip.
    async fn begin(&self, operation: BrokerOperation) -> Result<MutexGuard<'_, BrokerState>> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        state.journal.push((operation, Instant::now()));
        if let Some(remaining) = state.failures.get_mut(&operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BrokerError::request(operation, "injected failure"));
            }
        }
        Ok(state)
    }

    // ------------------------------------------------------------------------
    // Test controls and inspection
    // ------------------------------------------------------------------------

    /// Fail the next `times` calls of `operation`.
    pub fn fail_next(&self, operation: BrokerOperation, times: usize) {
        *self.state().failures.entry(operation).or_default() += times;
    }

    /// Every call made so far, in order.
    pub fn journal(&self) -> Vec<BrokerOperation> {
        self.state().journal.iter().map(|(op, _)| *op).collect()
    }

    pub fn call_count(&self, operation: BrokerOperation) -> usize {
        self.call_times(operation).len()
    }

    /// When each call of `operation` started, on the tokio clock.
    pub fn call_times(&self, operation: BrokerOperation) -> Vec<Instant> {
        self.state()
            .journal
            .iter()
            .filter(|(op, _)| *op == operation)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn topic_count(&self) -> usize {
        self.state().topics.len()
    }

    pub fn queue_count(&self) -> usize {
        self.state().queues.len()
    }

    /// Subscriptions on a topic, looked up by topic name.
    pub fn subscriptions(&self, topic_name: &str) -> Vec<SubscriptionRecord> {
        self.state()
            .topics
            .iter()
            .find(|t| t.name == topic_name)
            .map(|t| t.subscriptions.clone())
            .unwrap_or_default()
    }

    pub fn queue_policy(&self, queue_name: &str) -> Option<String> {
        self.state()
            .queues
            .get(queue_name)
            .and_then(|q| q.policy.clone())
    }

    /// Messages waiting to be received.
    pub fn visible_count(&self, queue_name: &str) -> usize {
        self.state()
            .queues
            .get(queue_name)
            .map_or(0, |q| q.visible.len())
    }

    /// Messages received but not yet deleted.
    pub fn in_flight_count(&self, queue_name: &str) -> usize {
        self.state()
            .queues
            .get(queue_name)
            .map_or(0, |q| q.in_flight.len())
    }

    /// Make unacknowledged messages visible again, as a lapsed visibility
    /// timeout would.
    pub fn requeue_in_flight(&self, queue_name: &str) -> usize {
        let mut state = self.state();
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return 0;
        };
        let returned: Vec<_> = queue.in_flight.drain(..).map(|(_, m)| m).collect();
        let count = returned.len();
        for message in returned.into_iter().rev() {
            queue.visible.push_front(message);
        }
        if count > 0 {
            queue.notify.notify_one();
        }
        count
    }

    /// Place a raw body on a queue, bypassing topic fan-out.
    pub fn send_raw(&self, queue_name: &str, body: impl Into<String>) -> bool {
        let mut state = self.state();
        match state.queues.get_mut(queue_name) {
            Some(queue) => {
                queue.deliver(StoredMessage {
                    message_id: Uuid::new_v4().to_string(),
                    body: body.into(),
                });
                true
            }
            None => false,
        }
    }

    /// Remove a topic and its subscriptions, as an administrator would.
    pub fn delete_topic(&self, topic_name: &str) -> bool {
        let mut state = self.state();
        let before = state.topics.len();
        state.topics.retain(|t| t.name != topic_name);
        state.topics.len() != before
    }
}

/// Whether a queue policy admits `sqs:SendMessage` from `source_arn`.
fn policy_allows(policy: &str, queue_arn: &str, source_arn: &str) -> bool {
    let Ok(document) = serde_json::from_str::<Value>(policy) else {
        return false;
    };
    let statements = match document.get("Statement") {
        Some(Value::Array(items)) => items.clone(),
        Some(single @ Value::Object(_)) => vec![single.clone()],
        _ => return false,
    };

    statements.iter().any(|statement| {
        let allows = statement.get("Effect").and_then(Value::as_str) == Some("Allow");
        let action = matches_any(statement.get("Action"), |a| {
            a == "sqs:SendMessage" || a == "sqs:*" || a == "*"
        });
        let resource = statement.get("Resource").is_none()
            || matches_any(statement.get("Resource"), |r| r == queue_arn || r == "*");
        let source = match statement.get("Condition") {
            None => true,
            Some(condition) => {
                let equals = condition
                    .get("ArnEquals")
                    .and_then(|c| c.get("aws:SourceArn"));
                let like = condition
                    .get("ArnLike")
                    .and_then(|c| c.get("aws:SourceArn"));
                matches_any(equals, |arn| arn == source_arn)
                    || matches_any(like, |arn| arn == source_arn || arn == "*")
            }
        };
        allows && action && resource && source
    })
}

fn matches_any(value: Option<&Value>, pred: impl Fn(&str) -> bool) -> bool {
    match value {
        Some(Value::String(s)) => pred(s),
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).any(pred),
        _ => false,
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn list_topics(&self) -> Result<Vec<String>> {
        let state = self.begin(BrokerOperation::ListTopics).await?;
        Ok(state.topics.iter().map(|t| t.arn.clone()).collect())
    }

    async fn create_topic(&self, name: &str) -> Result<String> {
        let mut state = self.begin(BrokerOperation::CreateTopic).await?;
        if let Some(topic) = state.topics.iter().find(|t| t.name == name) {
            return Ok(topic.arn.clone());
        }
        let arn = format!("arn:aws:sns:{}:{}:{}", REGION, ACCOUNT_ID, name);
        state.topics.push(TopicState {
            name: name.to_string(),
            arn: arn.clone(),
            subscriptions: Vec::new(),
        });
        debug!(topic = %name, arn = %arn, "Created in-memory topic");
        Ok(arn)
    }

    async fn create_queue(&self, name: &str) -> Result<String> {
        let mut state = self.begin(BrokerOperation::CreateQueue).await?;
        let queue = state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| QueueState {
                arn: format!("arn:aws:sqs:{}:{}:{}", REGION, ACCOUNT_ID, name),
                url: format!("{}/{}/{}", QUEUE_ENDPOINT, ACCOUNT_ID, name),
                policy: None,
                visible: VecDeque::new(),
                in_flight: Vec::new(),
                notify: Arc::new(Notify::new()),
            });
        Ok(queue.url.clone())
    }

    async fn get_queue_arn(&self, queue_url: &str) -> Result<String> {
        let op = BrokerOperation::GetQueueAttributes;
        let mut state = self.begin(op).await?;
        state
            .queue_by_url_mut(queue_url)
            .map(|q| q.arn.clone())
            .ok_or_else(|| BrokerError::not_found(op, queue_url))
    }

    async fn set_queue_policy(&self, queue_url: &str, policy: &str) -> Result<()> {
        let op = BrokerOperation::SetQueueAttributes;
        let mut state = self.begin(op).await?;
        let queue = state
            .queue_by_url_mut(queue_url)
            .ok_or_else(|| BrokerError::not_found(op, queue_url))?;
        queue.policy = Some(policy.to_string());
        Ok(())
    }

    async fn subscribe(&self, topic_arn: &str, queue_arn: &str) -> Result<String> {
        let op = BrokerOperation::Subscribe;
        let mut state = self.begin(op).await?;
        let topic = state
            .topic_by_arn_mut(topic_arn)
            .ok_or_else(|| BrokerError::not_found(op, topic_arn))?;

        if let Some(existing) = topic
            .subscriptions
            .iter()
            .find(|s| s.protocol == SQS_PROTOCOL && s.endpoint == queue_arn)
        {
            return Ok(existing.subscription_arn.clone());
        }

        let subscription_arn = format!("{}:{}", topic_arn, Uuid::new_v4());
        topic.subscriptions.push(SubscriptionRecord {
            subscription_arn: subscription_arn.clone(),
            topic_arn: topic_arn.to_string(),
            protocol: SQS_PROTOCOL.to_string(),
            endpoint: queue_arn.to_string(),
            owner: Some(ACCOUNT_ID.to_string()),
        });
        Ok(subscription_arn)
    }

    async fn get_subscription_attributes(
        &self,
        subscription_arn: &str,
    ) -> Result<SubscriptionRecord> {
        let op = BrokerOperation::GetSubscriptionAttributes;
        let state = self.begin(op).await?;
        state
            .topics
            .iter()
            .flat_map(|t| t.subscriptions.iter())
            .find(|s| s.subscription_arn == subscription_arn)
            .cloned()
            .ok_or_else(|| BrokerError::not_found(op, subscription_arn))
    }

    async fn list_subscriptions_by_topic(
        &self,
        topic_arn: &str,
    ) -> Result<Vec<SubscriptionRecord>> {
        let op = BrokerOperation::ListSubscriptionsByTopic;
        let mut state = self.begin(op).await?;
        state
            .topic_by_arn_mut(topic_arn)
            .map(|t| t.subscriptions.clone())
            .ok_or_else(|| BrokerError::not_found(op, topic_arn))
    }

    async fn get_queue_url(&self, queue_name: &str) -> Result<String> {
        let op = BrokerOperation::GetQueueUrl;
        let state = self.begin(op).await?;
        state
            .queues
            .get(queue_name)
            .map(|q| q.url.clone())
            .ok_or_else(|| BrokerError::not_found(op, queue_name))
    }

    async fn publish(&self, topic_arn: &str, message: &str) -> Result<String> {
        let op = BrokerOperation::Publish;
        let mut state = self.begin(op).await?;
        let endpoints: Vec<String> = state
            .topic_by_arn_mut(topic_arn)
            .ok_or_else(|| BrokerError::not_found(op, topic_arn))?
            .subscriptions
            .iter()
            .filter(|s| s.protocol == SQS_PROTOCOL)
            .map(|s| s.endpoint.clone())
            .collect();

        let message_id = Uuid::new_v4().to_string();
        let body = Notification::new(&message_id, topic_arn, message)
            .to_body()
            .map_err(|e| BrokerError::request(op, e))?;

        for endpoint in endpoints {
            let Some(queue) = state.queue_by_arn_mut(&endpoint) else {
                debug!(endpoint = %endpoint, "Subscription endpoint has no queue");
                continue;
            };
            let permitted = queue
                .policy
                .as_deref()
                .is_some_and(|p| policy_allows(p, &queue.arn, topic_arn));
            if !permitted {
                debug!(queue_arn = %queue.arn, "Queue policy rejects topic, dropping delivery");
                continue;
            }
            queue.deliver(StoredMessage {
                message_id: Uuid::new_v4().to_string(),
                body: body.clone(),
            });
        }

        Ok(message_id)
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_secs: i32,
    ) -> Result<Vec<ReceivedMessage>> {
        let op = BrokerOperation::ReceiveMessage;
        if !(1..=MAX_RECEIVE_BATCH).contains(&max_messages) {
            drop(self.begin(op).await?);
            return Err(BrokerError::request(
                op,
                format!("MaxNumberOfMessages must be between 1 and {MAX_RECEIVE_BATCH}"),
            ));
        }
        if !(0..=MAX_WAIT_TIME_SECS).contains(&wait_time_secs) {
            drop(self.begin(op).await?);
            return Err(BrokerError::request(
                op,
                format!("WaitTimeSeconds must be between 0 and {MAX_WAIT_TIME_SECS}"),
            ));
        }

        let deadline = Instant::now() + Duration::from_secs(wait_time_secs as u64);
        let notify = {
            let mut state = self.begin(op).await?;
            let queue = state
                .queue_by_url_mut(queue_url)
                .ok_or_else(|| BrokerError::not_found(op, queue_url))?;
            let batch = queue.take_visible(max_messages as usize);
            if !batch.is_empty() {
                return Ok(batch);
            }
            queue.notify.clone()
        };

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, notify.notified()).await;

            let mut state = self.state();
            let queue = state
                .queue_by_url_mut(queue_url)
                .ok_or_else(|| BrokerError::not_found(op, queue_url))?;
            let batch = queue.take_visible(max_messages as usize);
            if !batch.is_empty() {
                return Ok(batch);
            }
        }
    }

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteEntry>,
    ) -> Result<DeleteBatchOutcome> {
        let op = BrokerOperation::DeleteMessageBatch;
        let mut state = self.begin(op).await?;
        if entries.is_empty() || entries.len() > MAX_RECEIVE_BATCH as usize {
            return Err(BrokerError::request(
                op,
                format!("batch must hold 1 to {MAX_RECEIVE_BATCH} entries"),
            ));
        }
        let mut ids = HashSet::new();
        if !entries.iter().all(|entry| ids.insert(entry.id.as_str())) {
            return Err(BrokerError::request(op, "BatchEntryIdsNotDistinct"));
        }
        let queue = state
            .queue_by_url_mut(queue_url)
            .ok_or_else(|| BrokerError::not_found(op, queue_url))?;

        let mut outcome = DeleteBatchOutcome::default();
        for entry in entries {
            match queue
                .in_flight
                .iter()
                .position(|(receipt, _)| *receipt == entry.receipt_handle)
            {
                Some(index) => {
                    queue.in_flight.remove(index);
                }
                None => outcome.failed.push(entry.id),
            }
        }
        Ok(outcome)
    }
}
