//! AWS SNS/SQS broker implementation.
//!
//! SNS provides the shared topic, SQS the per-application queues. Topic and
//! subscription listings are paginated and followed to the last page.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sns::error::DisplayErrorContext;
use aws_sdk_sns::Client as SnsClient;
use aws_sdk_sqs::types::{DeleteMessageBatchRequestEntry, QueueAttributeName};
use aws_sdk_sqs::Client as SqsClient;
use tracing::{debug, info, warn};

use super::{
    Broker, BrokerError, BrokerOperation, DeleteBatchOutcome, DeleteEntry, ReceivedMessage,
    Result, SubscriptionRecord,
};
use crate::config::SnsSqsConfig;

/// Subscription attribute keys returned by GetSubscriptionAttributes.
const ATTR_SUBSCRIPTION_ARN: &str = "SubscriptionArn";
const ATTR_TOPIC_ARN: &str = "TopicArn";
const ATTR_PROTOCOL: &str = "Protocol";
const ATTR_ENDPOINT: &str = "Endpoint";
const ATTR_OWNER: &str = "Owner";

/// Broker backed by AWS SNS and SQS.
pub struct SnsSqsBroker {
    sns: SnsClient,
    sqs: SqsClient,
}

impl SnsSqsBroker {
    /// Build SNS/SQS clients from the default AWS provider chain.
    pub async fn new(config: &SnsSqsConfig) -> Self {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest());

        if let Some(ref region) = config.region {
            aws_config_builder =
                aws_config_builder.region(aws_config::Region::new(region.clone()));
        }

        if let Some(ref endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;

        info!(
            region = ?config.region,
            endpoint = ?config.endpoint_url,
            "Connected to AWS SNS/SQS"
        );

        Self::from_clients(SnsClient::new(&aws_config), SqsClient::new(&aws_config))
    }

    /// Wrap already-configured clients.
    pub fn from_clients(sns: SnsClient, sqs: SqsClient) -> Self {
        Self { sns, sqs }
    }
}

fn record_from_attributes(
    attrs: &HashMap<String, String>,
) -> std::result::Result<SubscriptionRecord, &'static str> {
    let get = |key: &'static str| attrs.get(key).cloned().ok_or(key);
    Ok(SubscriptionRecord {
        subscription_arn: get(ATTR_SUBSCRIPTION_ARN)?,
        topic_arn: get(ATTR_TOPIC_ARN)?,
        protocol: get(ATTR_PROTOCOL)?,
        endpoint: get(ATTR_ENDPOINT)?,
        owner: attrs.get(ATTR_OWNER).cloned(),
    })
}

#[async_trait]
impl Broker for SnsSqsBroker {
    async fn list_topics(&self) -> Result<Vec<String>> {
        let op = BrokerOperation::ListTopics;
        let mut arns = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let page = self
                .sns
                .list_topics()
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| BrokerError::request(op, DisplayErrorContext(&e)))?;

            arns.extend(
                page.topics()
                    .iter()
                    .filter_map(|t| t.topic_arn().map(str::to_string)),
            );

            match page.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        debug!(count = arns.len(), "Listed SNS topics");
        Ok(arns)
    }

    async fn create_topic(&self, name: &str) -> Result<String> {
        let op = BrokerOperation::CreateTopic;
        let result = self
            .sns
            .create_topic()
            .name(name)
            .send()
            .await
            .map_err(|e| BrokerError::request(op, DisplayErrorContext(&e)))?;

        result
            .topic_arn()
            .map(str::to_string)
            .ok_or_else(|| BrokerError::missing(op, "TopicArn"))
    }

    async fn create_queue(&self, name: &str) -> Result<String> {
        let op = BrokerOperation::CreateQueue;
        let result = self
            .sqs
            .create_queue()
            .queue_name(name)
            .send()
            .await
            .map_err(|e| BrokerError::request(op, aws_sdk_sqs::error::DisplayErrorContext(&e)))?;

        result
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| BrokerError::missing(op, "QueueUrl"))
    }

    async fn get_queue_arn(&self, queue_url: &str) -> Result<String> {
        let op = BrokerOperation::GetQueueAttributes;
        let result = self
            .sqs
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(|e| BrokerError::request(op, aws_sdk_sqs::error::DisplayErrorContext(&e)))?;

        result
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn))
            .cloned()
            .ok_or_else(|| BrokerError::missing(op, "QueueArn"))
    }

    async fn set_queue_policy(&self, queue_url: &str, policy: &str) -> Result<()> {
        let op = BrokerOperation::SetQueueAttributes;
        self.sqs
            .set_queue_attributes()
            .queue_url(queue_url)
            .attributes(QueueAttributeName::Policy, policy)
            .send()
            .await
            .map_err(|e| BrokerError::request(op, aws_sdk_sqs::error::DisplayErrorContext(&e)))?;
        Ok(())
    }

    async fn subscribe(&self, topic_arn: &str, queue_arn: &str) -> Result<String> {
        let op = BrokerOperation::Subscribe;
        let result = self
            .sns
            .subscribe()
            .topic_arn(topic_arn)
            .protocol(super::SQS_PROTOCOL)
            .endpoint(queue_arn)
            .return_subscription_arn(true)
            .send()
            .await
            .map_err(|e| BrokerError::request(op, DisplayErrorContext(&e)))?;

        result
            .subscription_arn()
            .map(str::to_string)
            .ok_or_else(|| BrokerError::missing(op, "SubscriptionArn"))
    }

    async fn get_subscription_attributes(
        &self,
        subscription_arn: &str,
    ) -> Result<SubscriptionRecord> {
        let op = BrokerOperation::GetSubscriptionAttributes;
        let result = self
            .sns
            .get_subscription_attributes()
            .subscription_arn(subscription_arn)
            .send()
            .await
            .map_err(|e| BrokerError::request(op, DisplayErrorContext(&e)))?;

        let attrs = result
            .attributes()
            .ok_or_else(|| BrokerError::missing(op, "Attributes"))?;
        record_from_attributes(attrs).map_err(|field| BrokerError::missing(op, field))
    }

    async fn list_subscriptions_by_topic(
        &self,
        topic_arn: &str,
    ) -> Result<Vec<SubscriptionRecord>> {
        let op = BrokerOperation::ListSubscriptionsByTopic;
        let mut records = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let page = self
                .sns
                .list_subscriptions_by_topic()
                .topic_arn(topic_arn)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| BrokerError::request(op, DisplayErrorContext(&e)))?;

            for sub in page.subscriptions() {
                // Pending confirmations carry no usable ARN or endpoint.
                let (Some(arn), Some(endpoint)) = (sub.subscription_arn(), sub.endpoint()) else {
                    continue;
                };
                records.push(SubscriptionRecord {
                    subscription_arn: arn.to_string(),
                    topic_arn: sub.topic_arn().unwrap_or(topic_arn).to_string(),
                    protocol: sub.protocol().unwrap_or_default().to_string(),
                    endpoint: endpoint.to_string(),
                    owner: sub.owner().map(str::to_string),
                });
            }

            match page.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(records)
    }

    async fn get_queue_url(&self, queue_name: &str) -> Result<String> {
        let op = BrokerOperation::GetQueueUrl;
        let result = self
            .sqs
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(|e| BrokerError::request(op, aws_sdk_sqs::error::DisplayErrorContext(&e)))?;

        result
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| BrokerError::missing(op, "QueueUrl"))
    }

    async fn publish(&self, topic_arn: &str, message: &str) -> Result<String> {
        let op = BrokerOperation::Publish;
        let result = self
            .sns
            .publish()
            .topic_arn(topic_arn)
            .message(message)
            .send()
            .await
            .map_err(|e| BrokerError::request(op, DisplayErrorContext(&e)))?;

        Ok(result.message_id().unwrap_or_default().to_string())
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_secs: i32,
    ) -> Result<Vec<ReceivedMessage>> {
        let op = BrokerOperation::ReceiveMessage;
        let output = self
            .sqs
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_time_secs)
            .send()
            .await
            .map_err(|e| BrokerError::request(op, aws_sdk_sqs::error::DisplayErrorContext(&e)))?;

        let mut received = Vec::new();
        for message in output.messages() {
            let (Some(message_id), Some(receipt_handle)) =
                (message.message_id(), message.receipt_handle())
            else {
                warn!(queue_url = %queue_url, "Skipping SQS message without id or receipt handle");
                continue;
            };
            received.push(ReceivedMessage {
                message_id: message_id.to_string(),
                receipt_handle: receipt_handle.to_string(),
                body: message.body().unwrap_or_default().to_string(),
            });
        }
        Ok(received)
    }

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteEntry>,
    ) -> Result<DeleteBatchOutcome> {
        let op = BrokerOperation::DeleteMessageBatch;
        let entries = entries
            .into_iter()
            .map(|entry| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(entry.id)
                    .receipt_handle(entry.receipt_handle)
                    .build()
                    .map_err(|e| BrokerError::request(op, e))
            })
            .collect::<Result<Vec<_>>>()?;

        let output = self
            .sqs
            .delete_message_batch()
            .queue_url(queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| BrokerError::request(op, aws_sdk_sqs::error::DisplayErrorContext(&e)))?;

        Ok(DeleteBatchOutcome {
            failed: output.failed().iter().map(|f| f.id().to_string()).collect(),
        })
    }
}
