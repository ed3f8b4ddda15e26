//! Internal events for metrics emission.
//!
//! Holds the `InternalEvent` trait and the events of the shared polling loop.
//! Service-specific events live in the crates that emit them and implement
//! the same trait, so `emit!` works for both.

use metrics::{counter, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Status of a request to an external collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }

    /// Status matching the outcome of `result`.
    pub fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            RequestStatus::Success
        } else {
            RequestStatus::Error
        }
    }
}

// ============================================================================
// Batch cycle events
// ============================================================================

/// Result type for batch cycle metrics.
#[derive(Debug, Clone, Copy)]
pub enum BatchResultType {
    /// At least one message was aggregated.
    Processed,
    /// Nothing was aggregated (empty receive, or all messages discarded/retained).
    Idle,
    /// The cycle failed before completing.
    Failed,
}

impl BatchResultType {
    fn as_str(&self) -> &'static str {
        match self {
            BatchResultType::Processed => "processed",
            BatchResultType::Idle => "idle",
            BatchResultType::Failed => "failed",
        }
    }
}

/// Event emitted when a batch cycle completes.
pub struct BatchCompleted {
    pub result: BatchResultType,
}

impl InternalEvent for BatchCompleted {
    fn emit(self) {
        trace!(result = self.result.as_str(), "Batch completed");
        counter!("tally_batches_total", "result" => self.result.as_str()).increment(1);
    }
}

/// Event emitted with the wall-clock duration of a batch cycle.
pub struct BatchDuration {
    pub duration: Duration,
}

impl InternalEvent for BatchDuration {
    fn emit(self) {
        trace!(duration_ms = self.duration.as_millis(), "Batch duration");
        histogram!("tally_batch_duration_seconds").record(self.duration.as_secs_f64());
    }
}
