//! Queue transport.
//!
//! [`QueueClient`] is the narrow surface the processor and the dead-letter
//! coordinator need from a managed queue: batch receive, acknowledge,
//! visibility control, and queue lifecycle. [`SqsQueueClient`] talks to SQS
//! (or LocalStack); [`InMemoryQueue`] reproduces SQS delivery semantics
//! in-process.

mod memory;
mod sqs;

pub use memory::InMemoryQueue;
pub use sqs::SqsQueueClient;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::QueueError;

/// Opaque per-delivery handle. A redelivery gets a new token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptToken(String);

impl ReceiptToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One delivery of a message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: Bytes,
    pub receipt: ReceiptToken,
    /// How many times this message has been received, including this time.
    pub receive_count: u32,
}

/// Parameters for a receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Upper bound on messages returned (1..=10).
    pub max_messages: u32,
    /// Long-poll wait in seconds (0..=20).
    pub wait_time_secs: u32,
    /// Visibility timeout applied to the received messages.
    pub visibility_timeout_secs: u32,
}

/// Queue attributes this service reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueAttribute {
    QueueArn,
    RedrivePolicy,
    VisibilityTimeout,
    ApproximateNumberOfMessages,
}

impl QueueAttribute {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueAttribute::QueueArn => "QueueArn",
            QueueAttribute::RedrivePolicy => "RedrivePolicy",
            QueueAttribute::VisibilityTimeout => "VisibilityTimeout",
            QueueAttribute::ApproximateNumberOfMessages => "ApproximateNumberOfMessages",
        }
    }
}

impl fmt::Display for QueueAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attribute map passed to create and set calls.
pub type QueueAttributes = HashMap<QueueAttribute, String>;

/// Transport to a managed queue service.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receive up to `options.max_messages` deliveries, long-polling.
    async fn receive(
        &self,
        queue_url: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<Delivery>, QueueError>;

    /// Acknowledge a delivery, removing the message.
    async fn delete(&self, queue_url: &str, receipt: &ReceiptToken) -> Result<(), QueueError>;

    /// Reset the remaining invisibility of a delivery to `timeout_secs`.
    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt: &ReceiptToken,
        timeout_secs: u32,
    ) -> Result<(), QueueError>;

    /// Look up a queue URL by name; `None` if the queue does not exist.
    async fn get_queue_url(&self, name: &str) -> Result<Option<String>, QueueError>;

    /// Create a queue and return its URL.
    async fn create_queue(
        &self,
        name: &str,
        attributes: &QueueAttributes,
    ) -> Result<String, QueueError>;

    /// Return the URL of `name`, creating it with `attributes` when absent.
    ///
    /// An existing queue is returned as-is; `attributes` are not applied to it.
    async fn get_or_create_queue(
        &self,
        name: &str,
        attributes: &QueueAttributes,
    ) -> Result<String, QueueError> {
        match self.get_queue_url(name).await? {
            Some(url) => Ok(url),
            None => self.create_queue(name, attributes).await,
        }
    }

    /// Read the requested attributes. Unset attributes are absent from the map.
    async fn get_queue_attributes(
        &self,
        queue_url: &str,
        names: &[QueueAttribute],
    ) -> Result<QueueAttributes, QueueError>;

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &QueueAttributes,
    ) -> Result<(), QueueError>;
}

/// Shared handle to a queue client.
pub type QueueRef = Arc<dyn QueueClient>;

#[async_trait]
impl<Q: QueueClient + ?Sized> QueueClient for Arc<Q> {
    async fn receive(
        &self,
        queue_url: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<Delivery>, QueueError> {
        (**self).receive(queue_url, options).await
    }

    async fn delete(&self, queue_url: &str, receipt: &ReceiptToken) -> Result<(), QueueError> {
        (**self).delete(queue_url, receipt).await
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt: &ReceiptToken,
        timeout_secs: u32,
    ) -> Result<(), QueueError> {
        (**self)
            .change_visibility(queue_url, receipt, timeout_secs)
            .await
    }

    async fn get_queue_url(&self, name: &str) -> Result<Option<String>, QueueError> {
        (**self).get_queue_url(name).await
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &QueueAttributes,
    ) -> Result<String, QueueError> {
        (**self).create_queue(name, attributes).await
    }

    async fn get_or_create_queue(
        &self,
        name: &str,
        attributes: &QueueAttributes,
    ) -> Result<String, QueueError> {
        (**self).get_or_create_queue(name, attributes).await
    }

    async fn get_queue_attributes(
        &self,
        queue_url: &str,
        names: &[QueueAttribute],
    ) -> Result<QueueAttributes, QueueError> {
        (**self).get_queue_attributes(queue_url, names).await
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &QueueAttributes,
    ) -> Result<(), QueueError> {
        (**self).set_queue_attributes(queue_url, attributes).await
    }
}
