//! Broker topology provisioning.
//!
//! Discovers or creates, in order: the shared outgoing topic, the
//! application's subscription on it, and (only when no subscription exists)
//! the application's queue with its access policy. Every step looks before
//! it creates, so the whole sequence is safe to repeat after a failure.

mod naming;
mod policy;

pub use naming::{
    ApplicationId, InvalidApplicationId, ResourceNames, DEFAULT_PREFIX, MAX_QUEUE_NAME_LEN,
};
pub use policy::{queue_send_policy, SEND_POLICY_SID};

use std::sync::Arc;

use tracing::{debug, info};

use crate::broker::{trailing_segment, Broker, Result, SubscriptionRecord, SQS_PROTOCOL};

/// Provisioned broker resources for one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Shared topic the application publishes to.
    pub topic_arn: String,
    /// Address of the application's queue.
    pub queue_arn: String,
    /// Request address of the application's queue.
    pub queue_url: String,
    /// Topic to queue binding.
    pub subscription: SubscriptionRecord,
}

/// Discover-or-create pipeline over a broker.
pub struct Provisioner {
    broker: Arc<dyn Broker>,
    names: ResourceNames,
}

impl Provisioner {
    pub fn new(broker: Arc<dyn Broker>, names: ResourceNames) -> Self {
        Self { broker, names }
    }

    pub fn names(&self) -> &ResourceNames {
        &self.names
    }

    /// Provision topic, queue, policy and subscription for an application.
    ///
    /// The first failing broker call aborts the sequence.
    #[tracing::instrument(name = "provision", skip_all, fields(application_id = %application_id))]
    pub async fn provision(&self, application_id: &ApplicationId) -> Result<Topology> {
        let topic_arn = self.find_or_create_topic().await?;
        let queue_name = self.names.queue_name(application_id);

        let subscription = match self.find_subscription(&topic_arn, &queue_name).await? {
            Some(existing) => {
                info!(
                    subscription_arn = %existing.subscription_arn,
                    "Found existing subscription"
                );
                existing
            }
            None => self.create_subscription(&topic_arn, &queue_name).await?,
        };

        let queue_url = self
            .broker
            .get_queue_url(trailing_segment(&subscription.endpoint))
            .await?;

        Ok(Topology {
            topic_arn,
            queue_arn: subscription.endpoint.clone(),
            queue_url,
            subscription,
        })
    }

    async fn find_or_create_topic(&self) -> Result<String> {
        let topic_name = self.names.topic_name();

        let existing = self
            .broker
            .list_topics()
            .await?
            .into_iter()
            .find(|arn| trailing_segment(arn) == topic_name);

        if let Some(arn) = existing {
            debug!(topic = %topic_name, arn = %arn, "Found outgoing topic");
            return Ok(arn);
        }

        let arn = self.broker.create_topic(&topic_name).await?;
        info!(topic = %topic_name, arn = %arn, "Created outgoing topic");
        Ok(arn)
    }

    /// Queue subscription whose endpoint name equals `queue_name`.
    async fn find_subscription(
        &self,
        topic_arn: &str,
        queue_name: &str,
    ) -> Result<Option<SubscriptionRecord>> {
        Ok(self
            .broker
            .list_subscriptions_by_topic(topic_arn)
            .await?
            .into_iter()
            .find(|sub| {
                sub.protocol == SQS_PROTOCOL && trailing_segment(&sub.endpoint) == queue_name
            }))
    }

    async fn create_subscription(
        &self,
        topic_arn: &str,
        queue_name: &str,
    ) -> Result<SubscriptionRecord> {
        let queue_url = self.broker.create_queue(queue_name).await?;
        let queue_arn = self.broker.get_queue_arn(&queue_url).await?;
        info!(queue = %queue_name, url = %queue_url, "Created/found incoming queue");

        let policy = queue_send_policy(&queue_arn, topic_arn).to_string();
        self.broker.set_queue_policy(&queue_url, &policy).await?;
        debug!(queue_arn = %queue_arn, topic_arn = %topic_arn, "Attached queue send policy");

        let subscription_arn = self.broker.subscribe(topic_arn, &queue_arn).await?;
        let record = self
            .broker
            .get_subscription_attributes(&subscription_arn)
            .await?;

        info!(
            subscription_arn = %record.subscription_arn,
            queue_arn = %queue_arn,
            topic_arn = %topic_arn,
            "Subscribed queue to topic"
        );
        Ok(record)
    }
}
