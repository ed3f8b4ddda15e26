//! Dead-letter queue provisioning.
//!
//! The coordinator makes sure a DLQ exists and that the main queue's
//! redrive policy points at it. Routing itself is done by the queue service
//! once a message exceeds `maxReceiveCount`; nothing here moves messages.

mod coordinator;
mod policy;

pub use coordinator::{DeadLetterCoordinator, QueueUrls};
pub use policy::RedrivePolicy;
