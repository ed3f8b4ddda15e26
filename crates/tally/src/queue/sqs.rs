//! Amazon SQS transport.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::config::Region;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{Message, MessageSystemAttributeName, QueueAttributeName};
use bytes::Bytes;
use tally_core::emit;
use tally_core::metrics::events::RequestStatus;
use tracing::{debug, warn};

use super::{Delivery, QueueAttribute, QueueAttributes, QueueClient, ReceiptToken, ReceiveOptions};
use crate::error::QueueError;
use crate::metrics::{QueueOperation, QueueRequest};

/// Queue client backed by the AWS SDK.
#[derive(Debug, Clone)]
pub struct SqsQueueClient {
    client: Client,
}

impl SqsQueueClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the default AWS credential chain.
    ///
    /// `endpoint_url` points the client at LocalStack or another
    /// SQS-compatible endpoint.
    pub async fn from_env(region: &str, endpoint_url: Option<&str>) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
        if let Some(endpoint) = endpoint_url {
            debug!(endpoint, "Using custom SQS endpoint");
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        Self::new(Client::new(&sdk_config))
    }
}

fn sqs_error(operation: QueueOperation, error: impl std::error::Error) -> QueueError {
    QueueError::Sqs {
        operation: operation.as_str(),
        message: DisplayErrorContext(error).to_string(),
    }
}

fn record<T>(operation: QueueOperation, result: Result<T, QueueError>) -> Result<T, QueueError> {
    emit!(QueueRequest {
        operation,
        status: RequestStatus::of(&result),
    });
    result
}

fn to_sdk_name(attribute: QueueAttribute) -> QueueAttributeName {
    match attribute {
        QueueAttribute::QueueArn => QueueAttributeName::QueueArn,
        QueueAttribute::RedrivePolicy => QueueAttributeName::RedrivePolicy,
        QueueAttribute::VisibilityTimeout => QueueAttributeName::VisibilityTimeout,
        QueueAttribute::ApproximateNumberOfMessages => {
            QueueAttributeName::ApproximateNumberOfMessages
        }
    }
}

fn from_sdk_name(name: &QueueAttributeName) -> Option<QueueAttribute> {
    match name {
        QueueAttributeName::QueueArn => Some(QueueAttribute::QueueArn),
        QueueAttributeName::RedrivePolicy => Some(QueueAttribute::RedrivePolicy),
        QueueAttributeName::VisibilityTimeout => Some(QueueAttribute::VisibilityTimeout),
        QueueAttributeName::ApproximateNumberOfMessages => {
            Some(QueueAttribute::ApproximateNumberOfMessages)
        }
        _ => None,
    }
}

fn to_sdk_attributes(attributes: &QueueAttributes) -> HashMap<QueueAttributeName, String> {
    attributes
        .iter()
        .map(|(name, value)| (to_sdk_name(*name), value.clone()))
        .collect()
}

/// Convert an SDK message, skipping ones without a receipt handle.
fn to_delivery(message: Message) -> Option<Delivery> {
    let receive_count = message
        .attributes
        .as_ref()
        .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
        .and_then(|count| count.parse::<u32>().ok())
        .unwrap_or(1);

    let Some(receipt) = message.receipt_handle else {
        warn!(
            message_id = message.message_id.as_deref().unwrap_or("unknown"),
            "Received message without receipt handle, skipping"
        );
        return None;
    };

    Some(Delivery {
        body: Bytes::from(message.body.unwrap_or_default()),
        receipt: ReceiptToken::new(receipt),
        receive_count: receive_count.max(1),
    })
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn receive(
        &self,
        queue_url: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<Delivery>, QueueError> {
        let result = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(options.max_messages as i32)
            .wait_time_seconds(options.wait_time_secs as i32)
            .visibility_timeout(options.visibility_timeout_secs as i32)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| sqs_error(QueueOperation::Receive, e))
            .map(|output| {
                output
                    .messages
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(to_delivery)
                    .collect()
            });
        record(QueueOperation::Receive, result)
    }

    async fn delete(&self, queue_url: &str, receipt: &ReceiptToken) -> Result<(), QueueError> {
        let result = self
            .client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt.as_str())
            .send()
            .await
            .map(|_| ())
            .map_err(|e| sqs_error(QueueOperation::Delete, e));
        record(QueueOperation::Delete, result)
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt: &ReceiptToken,
        timeout_secs: u32,
    ) -> Result<(), QueueError> {
        let result = self
            .client
            .change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt.as_str())
            .visibility_timeout(timeout_secs as i32)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| sqs_error(QueueOperation::ChangeVisibility, e));
        record(QueueOperation::ChangeVisibility, result)
    }

    async fn get_queue_url(&self, name: &str) -> Result<Option<String>, QueueError> {
        let result = match self.client.get_queue_url().queue_name(name).send().await {
            Ok(output) => Ok(output.queue_url),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|err| err.is_queue_does_not_exist()) =>
            {
                Ok(None)
            }
            Err(e) => Err(sqs_error(QueueOperation::GetQueueUrl, e)),
        };
        record(QueueOperation::GetQueueUrl, result)
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &QueueAttributes,
    ) -> Result<String, QueueError> {
        let result = self
            .client
            .create_queue()
            .queue_name(name)
            .set_attributes(Some(to_sdk_attributes(attributes)))
            .send()
            .await
            .map_err(|e| sqs_error(QueueOperation::CreateQueue, e))
            .and_then(|output| {
                output.queue_url.ok_or_else(|| QueueError::MissingAttribute {
                    attribute: "QueueUrl".to_string(),
                })
            });
        record(QueueOperation::CreateQueue, result)
    }

    async fn get_queue_attributes(
        &self,
        queue_url: &str,
        names: &[QueueAttribute],
    ) -> Result<QueueAttributes, QueueError> {
        let result = self
            .client
            .get_queue_attributes()
            .queue_url(queue_url)
            .set_attribute_names(Some(names.iter().copied().map(to_sdk_name).collect()))
            .send()
            .await
            .map_err(|e| sqs_error(QueueOperation::GetAttributes, e))
            .map(|output| {
                output
                    .attributes
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|(name, value)| from_sdk_name(&name).map(|attr| (attr, value)))
                    .collect()
            });
        record(QueueOperation::GetAttributes, result)
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &QueueAttributes,
    ) -> Result<(), QueueError> {
        let result = self
            .client
            .set_queue_attributes()
            .queue_url(queue_url)
            .set_attributes(Some(to_sdk_attributes(attributes)))
            .send()
            .await
            .map(|_| ())
            .map_err(|e| sqs_error(QueueOperation::SetAttributes, e));
        record(QueueOperation::SetAttributes, result)
    }
}
