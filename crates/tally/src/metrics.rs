//! Metric events for the tally service.
//!
//! Each struct implements [`InternalEvent`] from `tally-core` and is emitted
//! with `tally_core::emit!`.

use metrics::{counter, gauge};
use tally_core::metrics::events::{InternalEvent, RequestStatus};
use tracing::trace;

// ============================================================================
// Message flow events
// ============================================================================

/// Event emitted when a batch of messages is received from the queue.
pub struct MessagesReceived {
    pub count: u64,
}

impl InternalEvent for MessagesReceived {
    fn emit(self) {
        trace!(count = self.count, "Messages received");
        counter!("tally_messages_received_total").increment(self.count);
    }
}

/// Final disposition of a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Aggregated into the store and deleted.
    Aggregated,
    /// Permanently invalid, deleted without aggregation.
    Discarded,
    /// Left on the queue for redelivery.
    Retained,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Aggregated => "aggregated",
            Disposition::Discarded => "discarded",
            Disposition::Retained => "retained",
        }
    }
}

/// Event emitted once per delivery when its handling completes.
pub struct MessageHandled {
    pub disposition: Disposition,
}

impl InternalEvent for MessageHandled {
    fn emit(self) {
        trace!(disposition = self.disposition.as_str(), "Message handled");
        counter!("tally_messages_total", "disposition" => self.disposition.as_str()).increment(1);
    }
}

/// Event emitted when a message body fails validation.
pub struct ValidationFailed {
    /// Failure kind label (`malformed_payload` or `schema_violation`).
    pub kind: &'static str,
}

impl InternalEvent for ValidationFailed {
    fn emit(self) {
        trace!(kind = self.kind, "Validation failed");
        counter!("tally_validation_failures_total", "kind" => self.kind).increment(1);
    }
}

/// Event emitted when a redelivered message's visibility is extended.
pub struct VisibilityExtended {
    pub status: RequestStatus,
}

impl InternalEvent for VisibilityExtended {
    fn emit(self) {
        trace!(status = self.status.as_str(), "Visibility extended");
        counter!("tally_visibility_extensions_total", "status" => self.status.as_str())
            .increment(1);
    }
}

// ============================================================================
// Collaborator request events
// ============================================================================

/// Queue operation types.
#[derive(Debug, Clone, Copy)]
pub enum QueueOperation {
    Receive,
    Delete,
    ChangeVisibility,
    GetQueueUrl,
    CreateQueue,
    GetAttributes,
    SetAttributes,
}

impl QueueOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueOperation::Receive => "receive",
            QueueOperation::Delete => "delete",
            QueueOperation::ChangeVisibility => "change_visibility",
            QueueOperation::GetQueueUrl => "get_queue_url",
            QueueOperation::CreateQueue => "create_queue",
            QueueOperation::GetAttributes => "get_attributes",
            QueueOperation::SetAttributes => "set_attributes",
        }
    }
}

/// Event emitted when a queue request completes.
pub struct QueueRequest {
    pub operation: QueueOperation,
    pub status: RequestStatus,
}

impl InternalEvent for QueueRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Queue request"
        );
        counter!(
            "tally_queue_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Aggregate store operation types.
#[derive(Debug, Clone, Copy)]
pub enum StoreOperation {
    Ping,
    Increment,
    Get,
    GetAll,
    List,
    Reset,
}

impl StoreOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOperation::Ping => "ping",
            StoreOperation::Increment => "increment",
            StoreOperation::Get => "get",
            StoreOperation::GetAll => "get_all",
            StoreOperation::List => "list",
            StoreOperation::Reset => "reset",
        }
    }
}

/// Event emitted when an aggregate store request completes.
pub struct StoreRequest {
    pub operation: StoreOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StoreRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Store request"
        );
        counter!(
            "tally_store_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

// ============================================================================
// Lifecycle and health events
// ============================================================================

/// Event emitted for each startup health check of the aggregate store.
pub struct StoreConnectAttempt {
    pub status: RequestStatus,
}

impl InternalEvent for StoreConnectAttempt {
    fn emit(self) {
        trace!(status = self.status.as_str(), "Store connect attempt");
        counter!("tally_store_connect_attempts_total", "status" => self.status.as_str())
            .increment(1);
    }
}

/// Event emitted with the approximate number of messages parked in the DLQ.
pub struct DlqDepth {
    pub count: u64,
}

impl InternalEvent for DlqDepth {
    fn emit(self) {
        trace!(count = self.count, "DLQ depth");
        gauge!("tally_dlq_depth").set(self.count as f64);
    }
}

/// Event emitted when the processor enters a lifecycle state.
pub struct LifecycleTransition {
    pub state: &'static str,
}

impl InternalEvent for LifecycleTransition {
    fn emit(self) {
        trace!(state = self.state, "Lifecycle transition");
        counter!("tally_lifecycle_transitions_total", "state" => self.state).increment(1);
    }
}
