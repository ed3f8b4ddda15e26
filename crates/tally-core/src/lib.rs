//! tally-core: Shared infrastructure for the tally service.
//!
//! This crate contains the plumbing the event processor is built on:
//!
//! - `config/` - Environment variable interpolation, env parsing helpers, CLI arguments
//! - `metrics/` - Prometheus metrics events and the HTTP endpoint
//! - `backoff` - Capped exponential backoff schedule
//! - `polling` - Generic polling loop trait and runner
//! - `signal` - Signal handling for graceful shutdown
//! - `tracing` - Subscriber initialization
//! - `error` - Common error types

pub mod backoff;
pub mod config;
pub mod error;
pub mod metrics;
pub mod polling;
pub mod signal;
pub mod tracing;

// Re-export commonly used items
pub use backoff::ExponentialBackoff;
pub use config::{CliArgs, ServerConfig};
pub use error::{ConfigError, MetricsError, SetupError};
pub use self::metrics::{
    DEFAULT_SERVER_ADDR, MetricsController, init_global as init_metrics,
    init_test as init_metrics_test,
};
pub use polling::{IterationResult, PollingProcessor, run_polling_loop};
pub use signal::shutdown_signal;
pub use self::tracing::init_tracing;
