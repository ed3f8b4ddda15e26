use snafu::prelude::*;
use tally_core::emit;
use tracing::{debug, info, warn};

use super::RedrivePolicy;
use crate::config::QueueConfig;
use crate::error::{MainQueueSnafu, ProvisionError, QueueError};
use crate::metrics::DlqDepth;
use crate::queue::{QueueAttribute, QueueAttributes, QueueClient};

/// Resolved queue URLs, cached for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueUrls {
    pub queue_url: String,
    /// `None` when running without dead-letter protection.
    pub dlq_url: Option<String>,
}

/// Provisions the DLQ and binds the main queue to it.
pub struct DeadLetterCoordinator<Q> {
    client: Q,
    config: QueueConfig,
}

impl<Q: QueueClient> DeadLetterCoordinator<Q> {
    pub fn new(client: Q, config: QueueConfig) -> Self {
        Self { client, config }
    }

    /// Look up the DLQ, creating it if absent. A found queue is reused as-is.
    pub async fn ensure_dlq(&self) -> Result<String, QueueError> {
        let name = self.config.dlq_name();
        let url = self
            .client
            .get_or_create_queue(&name, &QueueAttributes::new())
            .await?;
        debug!(dlq = %name, url = %url, "DLQ ready");
        Ok(url)
    }

    /// Look up the main queue, creating it if absent, and bind its redrive
    /// policy to `dlq_url` unless one is already set.
    ///
    /// Failing to resolve the DLQ ARN or to apply attributes only costs DLQ
    /// protection; the queue URL is still returned.
    pub async fn ensure_main_queue(
        &self,
        dlq_url: Option<&str>,
    ) -> Result<String, ProvisionError> {
        let name = &self.config.name;

        let policy = match dlq_url {
            Some(dlq_url) => match self.dlq_arn(dlq_url).await {
                Ok(arn) => Some(RedrivePolicy::new(arn, self.config.max_receive_count)),
                Err(e) => {
                    warn!(
                        error = %e,
                        "Could not resolve DLQ ARN, continuing without redrive policy"
                    );
                    None
                }
            },
            None => None,
        };

        let existing = self
            .client
            .get_queue_url(name)
            .await
            .context(MainQueueSnafu { name })?;

        let Some(queue_url) = existing else {
            let attributes = self.queue_attributes(policy.as_ref());
            let url = self
                .client
                .create_queue(name, &attributes)
                .await
                .context(MainQueueSnafu { name })?;
            info!(
                queue = %name,
                redrive = policy.is_some(),
                visibility_timeout = self.config.visibility_timeout_secs,
                "Created queue"
            );
            return Ok(url);
        };

        if let Some(policy) = policy {
            self.bind_existing(&queue_url, &policy).await;
        }
        Ok(queue_url)
    }

    /// Provision both queues.
    ///
    /// Only failure to resolve the main queue is an error. Any DLQ problem
    /// is logged and the service runs without dead-letter protection.
    pub async fn provision(&self) -> Result<QueueUrls, ProvisionError> {
        let dlq_url = match self.ensure_dlq().await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(
                    error = %e,
                    dlq = %self.config.dlq_name(),
                    "Failed to provision DLQ, running without dead-letter protection"
                );
                None
            }
        };

        let queue_url = self.ensure_main_queue(dlq_url.as_deref()).await?;
        info!(queue_url = %queue_url, dlq_url = ?dlq_url, "Queues provisioned");
        Ok(QueueUrls { queue_url, dlq_url })
    }

    /// Approximate number of messages waiting in the DLQ.
    pub async fn dlq_depth(&self, dlq_url: &str) -> Result<u64, QueueError> {
        let attribute = QueueAttribute::ApproximateNumberOfMessages;
        let attributes = self
            .client
            .get_queue_attributes(dlq_url, &[attribute])
            .await?;

        attributes
            .get(&attribute)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| QueueError::MissingAttribute {
                attribute: attribute.to_string(),
            })
    }

    /// Sample the DLQ depth, export it, and warn when messages are waiting.
    ///
    /// Errors are logged and swallowed.
    pub async fn report_dlq_depth(&self, dlq_url: &str) -> Option<u64> {
        match self.dlq_depth(dlq_url).await {
            Ok(count) => {
                emit!(DlqDepth { count });
                if count > 0 {
                    warn!(count, dlq_url, "Messages waiting in DLQ");
                } else {
                    debug!(dlq_url, "DLQ is empty");
                }
                Some(count)
            }
            Err(e) => {
                warn!(error = %e, dlq_url, "Failed to read DLQ depth");
                None
            }
        }
    }

    async fn dlq_arn(&self, dlq_url: &str) -> Result<String, QueueError> {
        let mut attributes = self
            .client
            .get_queue_attributes(dlq_url, &[QueueAttribute::QueueArn])
            .await?;
        attributes
            .remove(&QueueAttribute::QueueArn)
            .ok_or_else(|| QueueError::MissingAttribute {
                attribute: QueueAttribute::QueueArn.to_string(),
            })
    }

    fn queue_attributes(&self, policy: Option<&RedrivePolicy>) -> QueueAttributes {
        let mut attributes = QueueAttributes::new();
        attributes.insert(
            QueueAttribute::VisibilityTimeout,
            self.config.visibility_timeout_secs.to_string(),
        );
        if let Some(policy) = policy {
            attributes.insert(QueueAttribute::RedrivePolicy, policy.to_json());
        }
        attributes
    }

    /// Apply `policy` to an existing queue that has none.
    async fn bind_existing(&self, queue_url: &str, policy: &RedrivePolicy) {
        let current = match self
            .client
            .get_queue_attributes(queue_url, &[QueueAttribute::RedrivePolicy])
            .await
        {
            Ok(attributes) => attributes,
            Err(e) => {
                warn!(error = %e, "Failed to read queue attributes, leaving queue as-is");
                return;
            }
        };

        if let Some(existing) = current.get(&QueueAttribute::RedrivePolicy) {
            debug!(policy = %existing, "Queue already has a redrive policy, leaving it unchanged");
            return;
        }

        let attributes = self.queue_attributes(Some(policy));
        match self.client.set_queue_attributes(queue_url, &attributes).await {
            Ok(()) => info!(
                queue = %self.config.name,
                max_receive_count = policy.max_receive_count,
                "Bound redrive policy to existing queue"
            ),
            Err(e) => warn!(
                error = %e,
                "Failed to apply redrive policy, running without dead-letter protection"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;
    use std::sync::Arc;
    use crate::metrics::QueueOperation;

    fn coordinator(queue: &Arc<InMemoryQueue>) -> DeadLetterCoordinator<Arc<InMemoryQueue>> {
        let config = QueueConfig {
            name: "events".to_string(),
            max_receive_count: 4,
            visibility_timeout_secs: 90,
            ..QueueConfig::default()
        };
        DeadLetterCoordinator::new(queue.clone(), config)
    }

    async fn redrive_of(queue: &InMemoryQueue, url: &str) -> Option<RedrivePolicy> {
        queue
            .get_queue_attributes(url, &[QueueAttribute::RedrivePolicy])
            .await
            .unwrap()
            .get(&QueueAttribute::RedrivePolicy)
            .map(|raw| RedrivePolicy::from_json(raw).unwrap())
    }

    #[tokio::test]
    async fn test_provision_creates_both_queues() {
        let queue = Arc::new(InMemoryQueue::new());
        let urls = coordinator(&queue).provision().await.unwrap();

        let dlq_url = urls.dlq_url.clone().unwrap();
        assert_eq!(queue.get_queue_url("events-dlq").await.unwrap(), Some(dlq_url.clone()));

        let arn = queue
            .get_queue_attributes(&dlq_url, &[QueueAttribute::QueueArn])
            .await
            .unwrap()
            .remove(&QueueAttribute::QueueArn)
            .unwrap();
        assert_eq!(
            redrive_of(&queue, &urls.queue_url).await,
            Some(RedrivePolicy::new(arn, 4))
        );

        let visibility = queue
            .get_queue_attributes(&urls.queue_url, &[QueueAttribute::VisibilityTimeout])
            .await
            .unwrap();
        assert_eq!(visibility[&QueueAttribute::VisibilityTimeout], "90");
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let queue = Arc::new(InMemoryQueue::new());
        let first = coordinator(&queue).provision().await.unwrap();
        let second = coordinator(&queue).provision().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_existing_queue_without_policy_gets_one() {
        let queue = Arc::new(InMemoryQueue::new());
        let url = queue.create_queue("events", &QueueAttributes::new()).await.unwrap();

        coordinator(&queue).provision().await.unwrap();

        let policy = redrive_of(&queue, &url).await.unwrap();
        assert_eq!(policy.max_receive_count, 4);
    }

    #[tokio::test]
    async fn test_existing_policy_left_untouched() {
        let queue = Arc::new(InMemoryQueue::new());
        let original = RedrivePolicy::new("arn:aws:sqs:memory:000000000000:elsewhere", 9);
        let mut attributes = QueueAttributes::new();
        attributes.insert(QueueAttribute::RedrivePolicy, original.to_json());
        let url = queue.create_queue("events", &attributes).await.unwrap();

        coordinator(&queue).provision().await.unwrap();

        assert_eq!(redrive_of(&queue, &url).await, Some(original));
    }

    #[tokio::test]
    async fn test_dlq_failure_degrades() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.set_failing(QueueOperation::CreateQueue, true);

        // The DLQ cannot be created, and neither can the main queue.
        assert!(coordinator(&queue).provision().await.is_err());

        // With the main queue already present, provisioning succeeds without a DLQ.
        queue.set_failing(QueueOperation::CreateQueue, false);
        let main = queue.create_queue("events", &QueueAttributes::new()).await.unwrap();
        queue.set_failing(QueueOperation::CreateQueue, true);

        let urls = coordinator(&queue).provision().await.unwrap();
        assert_eq!(urls.queue_url, main);
        assert_eq!(urls.dlq_url, None);
        assert_eq!(redrive_of(&queue, &main).await, None);
    }

    #[tokio::test]
    async fn test_attribute_failure_is_not_fatal() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.create_queue("events", &QueueAttributes::new()).await.unwrap();
        queue.set_failing(QueueOperation::SetAttributes, true);

        let urls = coordinator(&queue).provision().await.unwrap();
        assert!(urls.dlq_url.is_some());
        assert_eq!(redrive_of(&queue, &urls.queue_url).await, None);
    }

    #[tokio::test]
    async fn test_dlq_depth() {
        let queue = Arc::new(InMemoryQueue::new());
        let coordinator = coordinator(&queue);
        let dlq_url = coordinator.ensure_dlq().await.unwrap();
        assert_eq!(coordinator.dlq_depth(&dlq_url).await.unwrap(), 0);

        queue.send(&dlq_url, "dead").unwrap();
        assert_eq!(coordinator.report_dlq_depth(&dlq_url).await, Some(1));

        queue.set_failing(QueueOperation::GetAttributes, true);
        assert_eq!(coordinator.report_dlq_depth(&dlq_url).await, None);
    }
}
