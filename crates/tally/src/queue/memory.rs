//! In-process queue with SQS delivery semantics.
//!
//! Receives hide messages for the visibility timeout and hand out a fresh
//! receipt each time. Receive counts are tracked per message, and a queue
//! with a redrive policy moves a message to its dead-letter queue instead of
//! delivering it once `maxReceiveCount` receives have been used up.
//! Time is measured with `tokio::time::Instant`, so paused-clock tests can
//! advance through visibility timeouts.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{Delivery, QueueAttribute, QueueAttributes, QueueClient, ReceiptToken, ReceiveOptions};
use crate::dlq::RedrivePolicy;
use crate::error::QueueError;
use crate::metrics::QueueOperation;

const DEFAULT_VISIBILITY_TIMEOUT_SECS: u32 = 30;
const URL_SCHEME: &str = "memory://";
const ARN_PREFIX: &str = "arn:aws:sqs:memory:000000000000:";

#[derive(Debug)]
struct StoredMessage {
    id: u64,
    body: Bytes,
    receive_count: u32,
    invisible_until: Option<Instant>,
    receipt: Option<String>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.is_none_or(|until| until <= now)
    }
}

#[derive(Debug)]
struct QueueState {
    name: String,
    attributes: QueueAttributes,
    messages: VecDeque<StoredMessage>,
}

impl QueueState {
    fn visibility_timeout(&self) -> u32 {
        self.attributes
            .get(&QueueAttribute::VisibilityTimeout)
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_SECS)
    }

    fn redrive(&self) -> Option<RedrivePolicy> {
        self.attributes
            .get(&QueueAttribute::RedrivePolicy)
            .and_then(|raw| RedrivePolicy::from_json(raw).ok())
    }

    fn find_by_receipt(&mut self, receipt: &ReceiptToken) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.receipt.as_deref() == Some(receipt.as_str()))
    }
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, QueueState>,
    failing: HashSet<&'static str>,
    next_id: u64,
    next_receipt: u64,
}

impl State {
    fn queue(&mut self, url: &str) -> Result<&mut QueueState, QueueError> {
        self.queues
            .get_mut(url)
            .ok_or_else(|| QueueError::QueueNotFound {
                name: url.to_string(),
            })
    }

    fn check(&self, operation: QueueOperation) -> Result<(), QueueError> {
        if self.failing.contains(operation.as_str()) {
            return Err(QueueError::Sqs {
                operation: operation.as_str(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    /// Move visible messages that have used up their receives to the DLQ.
    fn redrive_exhausted(&mut self, url: &str, now: Instant) {
        let Some(policy) = self.queues.get(url).and_then(QueueState::redrive) else {
            return;
        };
        let Some(target) = url_for_arn(&policy.dead_letter_target_arn) else {
            return;
        };
        if target == url || !self.queues.contains_key(&target) {
            return;
        }

        let mut moved = Vec::new();
        if let Some(source) = self.queues.get_mut(url) {
            source.messages.retain_mut(|m| {
                if m.is_visible(now) && m.receive_count >= policy.max_receive_count {
                    moved.push(StoredMessage {
                        id: m.id,
                        body: m.body.clone(),
                        receive_count: 0,
                        invisible_until: None,
                        receipt: None,
                    });
                    false
                } else {
                    true
                }
            });
        }

        if !moved.is_empty() {
            debug!(source = url, target = %target, count = moved.len(), "Moved messages to DLQ");
            if let Some(dlq) = self.queues.get_mut(&target) {
                dlq.messages.extend(moved);
            }
        }
    }

    fn take_visible(
        &mut self,
        url: &str,
        options: &ReceiveOptions,
        now: Instant,
    ) -> Vec<Delivery> {
        self.redrive_exhausted(url, now);

        let Some(queue) = self.queues.get_mut(url) else {
            return Vec::new();
        };
        let timeout = Duration::from_secs(u64::from(options.visibility_timeout_secs));
        let limit = options.max_messages.clamp(1, 10) as usize;

        let mut deliveries = Vec::new();
        for message in queue.messages.iter_mut() {
            if deliveries.len() == limit {
                break;
            }
            if !message.is_visible(now) {
                continue;
            }
            self.next_receipt += 1;
            let receipt = format!("{}-{}-{}", queue.name, message.id, self.next_receipt);
            message.receive_count += 1;
            message.invisible_until = Some(now + timeout);
            message.receipt = Some(receipt.clone());
            deliveries.push(Delivery {
                body: message.body.clone(),
                receipt: ReceiptToken::new(receipt),
                receive_count: message.receive_count,
            });
        }
        deliveries
    }

    /// Earliest moment an in-flight message becomes visible again.
    fn next_visible_at(&self, url: &str) -> Option<Instant> {
        self.queues
            .get(url)?
            .messages
            .iter()
            .filter_map(|m| m.invisible_until)
            .min()
    }
}

fn url_for_name(name: &str) -> String {
    format!("{URL_SCHEME}{name}")
}

fn arn_for_name(name: &str) -> String {
    format!("{ARN_PREFIX}{name}")
}

fn url_for_arn(arn: &str) -> Option<String> {
    arn.strip_prefix(ARN_PREFIX).map(url_for_name)
}

/// In-memory queue service holding any number of named queues.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<State>,
    arrivals: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a message body, as a producer would.
    pub fn send(&self, queue_url: &str, body: impl Into<Bytes>) -> Result<(), QueueError> {
        {
            let mut state = self.state();
            state.next_id += 1;
            let id = state.next_id;
            state.queue(queue_url)?.messages.push_back(StoredMessage {
                id,
                body: body.into(),
                receive_count: 0,
                invisible_until: None,
                receipt: None,
            });
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    /// Make every call of `operation` fail until cleared.
    pub fn set_failing(&self, operation: QueueOperation, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing.insert(operation.as_str());
        } else {
            state.failing.remove(operation.as_str());
        }
    }

    /// Total messages in the queue, visible or in flight.
    pub fn len(&self, queue_url: &str) -> usize {
        self.state()
            .queues
            .get(queue_url)
            .map_or(0, |q| q.messages.len())
    }

    pub fn is_empty(&self, queue_url: &str) -> bool {
        self.len(queue_url) == 0
    }

    /// Bodies of all messages in the queue, in order.
    pub fn bodies(&self, queue_url: &str) -> Vec<Bytes> {
        self.state().queues.get(queue_url).map_or_else(Vec::new, |q| {
            q.messages.iter().map(|m| m.body.clone()).collect()
        })
    }

    /// Seconds until the delivery holding `receipt` becomes visible again.
    pub fn remaining_visibility(
        &self,
        queue_url: &str,
        receipt: &ReceiptToken,
    ) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.state();
        let queue = state.queues.get_mut(queue_url)?;
        let index = queue.find_by_receipt(receipt)?;
        queue.messages[index]
            .invisible_until
            .map(|until| until.saturating_duration_since(now))
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn receive(
        &self,
        queue_url: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<Delivery>, QueueError> {
        let deadline = Instant::now() + Duration::from_secs(u64::from(options.wait_time_secs));

        loop {
            // Register interest before checking so a send between the check
            // and the wait is not missed.
            let arrived = self.arrivals.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            let next_visible = {
                let mut state = self.state();
                state.check(QueueOperation::Receive)?;
                state.queue(queue_url)?;

                let now = Instant::now();
                let deliveries = state.take_visible(queue_url, options, now);
                if !deliveries.is_empty() || now >= deadline {
                    return Ok(deliveries);
                }
                state.next_visible_at(queue_url)
            };

            let wake = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut arrived => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn delete(&self, queue_url: &str, receipt: &ReceiptToken) -> Result<(), QueueError> {
        let mut state = self.state();
        state.check(QueueOperation::Delete)?;
        let queue = state.queue(queue_url)?;
        let index = queue
            .find_by_receipt(receipt)
            .ok_or(QueueError::InvalidReceipt)?;
        queue.messages.remove(index);
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt: &ReceiptToken,
        timeout_secs: u32,
    ) -> Result<(), QueueError> {
        let now = Instant::now();
        let mut state = self.state();
        state.check(QueueOperation::ChangeVisibility)?;
        let queue = state.queue(queue_url)?;
        let index = queue
            .find_by_receipt(receipt)
            .ok_or(QueueError::InvalidReceipt)?;

        let message = &mut queue.messages[index];
        if message.is_visible(now) {
            // The delivery's window already lapsed; the receipt is stale.
            return Err(QueueError::InvalidReceipt);
        }
        message.invisible_until = Some(now + Duration::from_secs(u64::from(timeout_secs)));
        drop(state);

        if timeout_secs == 0 {
            self.arrivals.notify_waiters();
        }
        Ok(())
    }

    async fn get_queue_url(&self, name: &str) -> Result<Option<String>, QueueError> {
        let state = self.state();
        state.check(QueueOperation::GetQueueUrl)?;
        let url = url_for_name(name);
        Ok(state.queues.contains_key(&url).then_some(url))
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &QueueAttributes,
    ) -> Result<String, QueueError> {
        let mut state = self.state();
        state.check(QueueOperation::CreateQueue)?;
        let url = url_for_name(name);
        state.queues.entry(url.clone()).or_insert_with(|| QueueState {
            name: name.to_string(),
            attributes: attributes.clone(),
            messages: VecDeque::new(),
        });
        Ok(url)
    }

    async fn get_queue_attributes(
        &self,
        queue_url: &str,
        names: &[QueueAttribute],
    ) -> Result<QueueAttributes, QueueError> {
        let now = Instant::now();
        let mut state = self.state();
        state.check(QueueOperation::GetAttributes)?;
        let queue = state.queue(queue_url)?;

        let mut attributes = QueueAttributes::new();
        for name in names {
            let value = match name {
                QueueAttribute::QueueArn => Some(arn_for_name(&queue.name)),
                QueueAttribute::VisibilityTimeout => Some(queue.visibility_timeout().to_string()),
                QueueAttribute::ApproximateNumberOfMessages => Some(
                    queue
                        .messages
                        .iter()
                        .filter(|m| m.is_visible(now))
                        .count()
                        .to_string(),
                ),
                QueueAttribute::RedrivePolicy => {
                    queue.attributes.get(&QueueAttribute::RedrivePolicy).cloned()
                }
            };
            if let Some(value) = value {
                attributes.insert(*name, value);
            }
        }
        Ok(attributes)
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &QueueAttributes,
    ) -> Result<(), QueueError> {
        let mut state = self.state();
        state.check(QueueOperation::SetAttributes)?;
        let queue = state.queue(queue_url)?;

        for (name, value) in attributes {
            match name {
                QueueAttribute::RedrivePolicy | QueueAttribute::VisibilityTimeout => {
                    queue.attributes.insert(*name, value.clone());
                }
                QueueAttribute::QueueArn | QueueAttribute::ApproximateNumberOfMessages => {
                    return Err(QueueError::Sqs {
                        operation: QueueOperation::SetAttributes.as_str(),
                        message: format!("attribute {name} is read-only"),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(visibility_timeout_secs: u32) -> ReceiveOptions {
        ReceiveOptions {
            max_messages: 10,
            wait_time_secs: 0,
            visibility_timeout_secs,
        }
    }

    async fn queue_with(names: &[&str]) -> InMemoryQueue {
        let queue = InMemoryQueue::new();
        for name in names {
            queue.create_queue(name, &QueueAttributes::new()).await.unwrap();
        }
        queue
    }

    #[tokio::test(start_paused = true)]
    async fn test_received_message_is_hidden_until_timeout() {
        let queue = queue_with(&["q"]).await;
        let url = url_for_name("q");
        queue.send(&url, "a").unwrap();

        let first = queue.receive(&url, &options(30)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);
        assert!(queue.receive(&url, &options(30)).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;

        let second = queue.receive(&url, &options(30)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].receive_count, 2);
        assert_ne!(first[0].receipt, second[0].receipt);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_receipt_cannot_delete() {
        let queue = queue_with(&["q"]).await;
        let url = url_for_name("q");
        queue.send(&url, "a").unwrap();

        let first = queue.receive(&url, &options(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        let second = queue.receive(&url, &options(1)).await.unwrap();

        assert!(matches!(
            queue.delete(&url, &first[0].receipt).await,
            Err(QueueError::InvalidReceipt)
        ));
        queue.delete(&url, &second[0].receipt).await.unwrap();
        assert!(queue.is_empty(&url));
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_visibility_extends_window() {
        let queue = queue_with(&["q"]).await;
        let url = url_for_name("q");
        queue.send(&url, "a").unwrap();

        let delivery = queue.receive(&url, &options(10)).await.unwrap().remove(0);
        tokio::time::advance(Duration::from_secs(8)).await;
        queue.change_visibility(&url, &delivery.receipt, 60).await.unwrap();

        assert_eq!(
            queue.remaining_visibility(&url, &delivery.receipt),
            Some(Duration::from_secs(60))
        );
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(queue.receive(&url, &options(10)).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_on_send() {
        let queue = std::sync::Arc::new(queue_with(&["q"]).await);
        let url = url_for_name("q");

        let producer = queue.clone();
        let producer_url = url.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            producer.send(&producer_url, "late").unwrap();
        });

        let opts = ReceiveOptions {
            max_messages: 10,
            wait_time_secs: 20,
            visibility_timeout_secs: 30,
        };
        let started = Instant::now();
        let deliveries = queue.receive(&url, &opts).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_redrive_moves_exhausted_message() {
        let queue = queue_with(&["q-dlq"]).await;
        let dlq_url = url_for_name("q-dlq");
        let mut attributes = QueueAttributes::new();
        attributes.insert(
            QueueAttribute::RedrivePolicy,
            RedrivePolicy::new(arn_for_name("q-dlq"), 2).to_json(),
        );
        let url = queue.create_queue("q", &attributes).await.unwrap();
        queue.send(&url, "poison").unwrap();

        for expected in 1..=2 {
            let deliveries = queue.receive(&url, &options(1)).await.unwrap();
            assert_eq!(deliveries[0].receive_count, expected);
            tokio::time::advance(Duration::from_secs(2)).await;
        }

        assert!(queue.receive(&url, &options(1)).await.unwrap().is_empty());
        assert!(queue.is_empty(&url));
        assert_eq!(queue.bodies(&dlq_url), vec![Bytes::from("poison")]);
    }

    #[tokio::test]
    async fn test_queue_lookup_and_attributes() {
        let queue = InMemoryQueue::new();
        assert_eq!(queue.get_queue_url("q").await.unwrap(), None);

        let url = queue
            .get_or_create_queue("q", &QueueAttributes::new())
            .await
            .unwrap();
        assert_eq!(queue.get_queue_url("q").await.unwrap(), Some(url.clone()));

        let attrs = queue
            .get_queue_attributes(
                &url,
                &[QueueAttribute::QueueArn, QueueAttribute::RedrivePolicy],
            )
            .await
            .unwrap();
        assert_eq!(attrs[&QueueAttribute::QueueArn], arn_for_name("q"));
        assert!(!attrs.contains_key(&QueueAttribute::RedrivePolicy));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let queue = queue_with(&["q"]).await;
        let url = url_for_name("q");
        queue.set_failing(QueueOperation::Receive, true);
        assert!(queue.receive(&url, &options(30)).await.is_err());

        queue.set_failing(QueueOperation::Receive, false);
        assert!(queue.receive(&url, &options(30)).await.is_ok());
    }
}
