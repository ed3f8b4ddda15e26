//! One receive-process-acknowledge pass over a batch of deliveries.
//!
//! A delivery is deleted only once its fate is settled: aggregated, or
//! permanently invalid. Anything ambiguous stays on the queue so that the
//! queue's own redelivery and redrive policy decide what happens next.

use std::time::Duration;

use async_trait::async_trait;
use tally_core::emit;
use tally_core::metrics::events::RequestStatus;
use tally_core::polling::{IterationResult, PollingProcessor};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::dlq::{DeadLetterCoordinator, QueueUrls};
use crate::error::{ProcessorError, QueueError};
use crate::metrics::{
    Disposition, MessageHandled, MessagesReceived, ValidationFailed, VisibilityExtended,
};
use crate::queue::{Delivery, QueueClient, ReceiveOptions};
use crate::store::AggregateStore;
use crate::validator::validate;

/// Knobs for the batch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSettings {
    pub receive: ReceiveOptions,
    pub max_receive_count: u32,
    /// Deliveries whose receive count exceeds this get a fresh visibility window.
    pub visibility_extension_threshold: u32,
    /// Interval between DLQ depth samples; `None` disables sampling.
    pub dlq_check_interval: Option<Duration>,
}

/// Tally of one batch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Deliveries returned by the receive call.
    pub received: usize,
    /// Aggregated and deleted.
    pub processed: usize,
    /// Rejected by validation and deleted.
    pub discarded: usize,
    /// Left on the queue for redelivery, including messages whose delete failed.
    pub retained: usize,
    /// Retained deliveries that are one receive away from the DLQ.
    pub nearing_dlq: usize,
    /// Not examined because shutdown was requested.
    pub interrupted: usize,
}

impl BatchOutcome {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Aggregated => self.processed += 1,
            Disposition::Discarded => self.discarded += 1,
            Disposition::Retained => self.retained += 1,
        }
        emit!(MessageHandled { disposition });
    }
}

/// Runs batch cycles against a provisioned queue.
pub struct BatchProcessor<Q, S> {
    queue: Q,
    store: S,
    urls: QueueUrls,
    settings: BatchSettings,
    shutdown: CancellationToken,
    dlq: Option<DeadLetterCoordinator<Q>>,
    last_dlq_check: Option<Instant>,
}

impl<Q: QueueClient, S: AggregateStore> BatchProcessor<Q, S> {
    pub fn new(
        queue: Q,
        store: S,
        urls: QueueUrls,
        settings: BatchSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            store,
            urls,
            settings,
            shutdown,
            dlq: None,
            last_dlq_check: None,
        }
    }

    /// Sample the DLQ depth through `coordinator` while idle.
    pub fn with_dlq_monitor(mut self, coordinator: DeadLetterCoordinator<Q>) -> Self {
        self.dlq = Some(coordinator);
        self
    }

    pub fn urls(&self) -> &QueueUrls {
        &self.urls
    }

    /// Receive one batch and handle it.
    pub async fn run_batch(&mut self) -> Result<BatchOutcome, ProcessorError> {
        let deliveries = self.receive().await?;
        Ok(self.handle_batch(deliveries).await)
    }

    /// Long-poll for up to `batch_size` deliveries.
    pub async fn receive(&self) -> Result<Vec<Delivery>, ProcessorError> {
        let deliveries = self
            .queue
            .receive(&self.urls.queue_url, &self.settings.receive)
            .await
            .map_err(|source| ProcessorError::Receive { source })?;

        if !deliveries.is_empty() {
            emit!(MessagesReceived {
                count: deliveries.len() as u64,
            });
            debug!(count = deliveries.len(), "Received messages");
        }
        Ok(deliveries)
    }

    /// Handle deliveries in order, stopping early on shutdown.
    ///
    /// The message in progress always completes; ones not yet examined are
    /// left untouched and become visible again after their timeout.
    pub async fn handle_batch(&mut self, deliveries: Vec<Delivery>) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            received: deliveries.len(),
            ..BatchOutcome::default()
        };

        for (index, delivery) in deliveries.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                outcome.interrupted = deliveries.len() - index;
                warn!(
                    remaining = outcome.interrupted,
                    "Shutdown requested, leaving rest of batch for redelivery"
                );
                break;
            }
            self.handle_delivery(delivery, &mut outcome).await;
        }

        debug!(
            received = outcome.received,
            processed = outcome.processed,
            discarded = outcome.discarded,
            retained = outcome.retained,
            "Batch complete"
        );
        outcome
    }

    async fn handle_delivery(&self, delivery: &Delivery, outcome: &mut BatchOutcome) {
        let queue_url = &self.urls.queue_url;
        let receive_count = delivery.receive_count;

        if receive_count > self.settings.visibility_extension_threshold {
            self.extend_visibility(delivery).await;
        }

        let event = match validate(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    kind = e.kind().as_str(),
                    error = %e,
                    body = %String::from_utf8_lossy(&delivery.body),
                    "Discarding invalid message"
                );
                emit!(ValidationFailed {
                    kind: e.kind().as_str(),
                });
                let disposition = match self.queue.delete(queue_url, &delivery.receipt).await {
                    Ok(()) => Disposition::Discarded,
                    Err(e) => {
                        warn!(error = %e, "Failed to delete invalid message");
                        Disposition::Retained
                    }
                };
                outcome.record(disposition);
                return;
            }
        };

        if let Err(e) = self.store.increment(&event.event_type, event.value).await {
            error!(
                error = %e,
                event_type = %event.event_type,
                receive_count,
                "Failed to aggregate event, leaving message for redelivery"
            );
            if receive_count >= self.settings.max_receive_count.saturating_sub(1) {
                warn!(
                    receive_count,
                    max_receive_count = self.settings.max_receive_count,
                    event_type = %event.event_type,
                    "Message is about to be moved to the DLQ"
                );
                outcome.nearing_dlq += 1;
            }
            outcome.record(Disposition::Retained);
            return;
        }

        match self.queue.delete(queue_url, &delivery.receipt).await {
            Ok(()) => {
                debug!(event_type = %event.event_type, value = event.value, "Aggregated event");
                outcome.record(Disposition::Aggregated);
            }
            Err(e) => {
                // Already counted; redelivery will count it again.
                warn!(
                    error = %e,
                    event_type = %event.event_type,
                    "Failed to delete aggregated message"
                );
                outcome.record(Disposition::Retained);
            }
        }
    }

    async fn extend_visibility(&self, delivery: &Delivery) {
        let timeout = self.settings.receive.visibility_timeout_secs;
        warn!(
            receive_count = delivery.receive_count,
            timeout_secs = timeout,
            "Redelivered message, extending visibility"
        );

        let result: Result<(), QueueError> = self
            .queue
            .change_visibility(&self.urls.queue_url, &delivery.receipt, timeout)
            .await;
        emit!(VisibilityExtended {
            status: RequestStatus::of(&result),
        });
        if let Err(e) = result {
            warn!(error = %e, "Failed to extend visibility");
        }
    }

    async fn check_dlq_if_due(&mut self) {
        let (Some(coordinator), Some(dlq_url), Some(interval)) = (
            self.dlq.as_ref(),
            self.urls.dlq_url.as_deref(),
            self.settings.dlq_check_interval,
        ) else {
            return;
        };

        let now = Instant::now();
        if self
            .last_dlq_check
            .is_some_and(|last| now.duration_since(last) < interval)
        {
            return;
        }
        self.last_dlq_check = Some(now);
        coordinator.report_dlq_depth(dlq_url).await;
    }
}

#[async_trait]
impl<Q, S> PollingProcessor for BatchProcessor<Q, S>
where
    Q: QueueClient,
    S: AggregateStore,
{
    type State = Vec<Delivery>;
    type Error = ProcessorError;

    async fn prepare(&mut self) -> Result<Option<Vec<Delivery>>, ProcessorError> {
        let deliveries = self.receive().await?;
        Ok((!deliveries.is_empty()).then_some(deliveries))
    }

    async fn process(
        &mut self,
        deliveries: Vec<Delivery>,
    ) -> Result<IterationResult, ProcessorError> {
        let outcome = self.handle_batch(deliveries).await;
        if outcome.interrupted > 0 {
            return Ok(IterationResult::Shutdown);
        }
        Ok(IterationResult::Processed(outcome.processed))
    }

    async fn on_idle(&mut self) {
        self.check_dlq_if_due().await;
    }
}
