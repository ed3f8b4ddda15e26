//! Error types for the tally service.

use snafu::prelude::*;

pub use tally_core::error::SetupError;

/// Errors returned by a queue transport.
///
/// All of these are treated as transient by the processor: the current
/// message or cycle is abandoned and the queue redelivers later.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueueError {
    /// The transport rejected or failed a request.
    #[snafu(display("Queue {operation} failed: {message}"))]
    Sqs {
        operation: &'static str,
        message: String,
    },

    /// No queue with the given name or URL exists.
    #[snafu(display("Queue not found: {name}"))]
    QueueNotFound { name: String },

    /// A required attribute was absent from a response.
    #[snafu(display("Queue response is missing attribute {attribute}"))]
    MissingAttribute { attribute: String },

    /// The receipt token is unknown or no longer valid.
    #[snafu(display("Receipt token is invalid or expired"))]
    InvalidReceipt,
}

/// Errors returned by an aggregate store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// Redis command or connection failure.
    #[snafu(display("Redis error: {source}"))]
    Redis { source: redis::RedisError },

    /// A stored value could not be read as a number.
    #[snafu(display("Corrupt value at {key}: '{value}'"))]
    Corrupt { key: String, value: String },

    /// The store refused the operation.
    #[snafu(display("Store unavailable: {message}"))]
    Unavailable { message: String },
}

/// Errors while provisioning the main queue.
///
/// DLQ problems never surface here; they degrade to running without
/// dead-letter protection.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProvisionError {
    /// The main queue URL could not be resolved or created.
    #[snafu(display("Failed to provision queue {name}: {source}"))]
    MainQueue { name: String, source: QueueError },
}

/// Errors that abandon a single batch cycle.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProcessorError {
    /// The receive call failed.
    #[snafu(display("Failed to receive messages: {source}"))]
    Receive { source: QueueError },
}

/// Errors that prevent the service from reaching the running state.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StartupError {
    /// The store client could not be created.
    #[snafu(display("Aggregate store error: {source}"))]
    Store { source: StoreError },

    /// The store never answered a ping.
    #[snafu(display("Aggregate store unavailable after {attempts} attempts"))]
    StoreUnavailable { attempts: u32 },

    /// HTTP or metrics setup failed.
    #[snafu(display("Setup error: {source}"))]
    Setup { source: SetupError },
}

impl From<SetupError> for StartupError {
    fn from(source: SetupError) -> Self {
        StartupError::Setup { source }
    }
}
