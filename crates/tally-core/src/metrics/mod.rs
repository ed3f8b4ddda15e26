//! Metrics and observability infrastructure.
//!
//! - `events`: Internal event types and the `InternalEvent` trait
//! - `server`: Prometheus recorder and the HTTP server that exposes it

pub mod events;
pub mod server;

pub use server::{DEFAULT_SERVER_ADDR, MetricsController, init_global, init_test, serve};

/// Emit an internal metric event.
///
/// Calls `InternalEvent::emit()` on the given event, which records the
/// corresponding Prometheus metric.
///
/// ```ignore
/// use tally_core::emit;
/// use tally_core::metrics::events::{BatchCompleted, BatchResultType};
///
/// emit!(BatchCompleted { result: BatchResultType::Idle });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
