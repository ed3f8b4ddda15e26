//! Tally: aggregate numeric events from a queue into per-type statistics.
//!
//! This crate handles:
//! - Receiving batches of messages from SQS with long polling
//! - Validating message bodies and discarding poison messages
//! - Aggregating counts and sums atomically in Redis
//! - Provisioning the dead-letter queue and redrive policy
//! - Serving the aggregates over a small read API

pub mod api;
pub mod config;
pub mod dlq;
pub mod error;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod store;
pub mod validator;

use std::sync::Arc;

use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// Re-export commonly used items
pub use config::TallyConfig;
pub use error::StartupError;
pub use processor::{Engine, Lifecycle};
pub use tally_core::{CliArgs, init_tracing};

use crate::error::StoreSnafu;
use crate::queue::{QueueRef, SqsQueueClient};
use crate::store::{RedisStore, StoreRef};

/// Wire up the production backends and run until shutdown.
///
/// Starts the HTTP server, waits for Redis, provisions the queues and runs
/// the processor. SIGINT/SIGTERM stop the processor after the message in
/// progress, then the server.
pub async fn run(config: TallyConfig) -> Result<(), StartupError> {
    let store: StoreRef = Arc::new(RedisStore::new(&config.store.redis()).context(StoreSnafu)?);
    let queue: QueueRef = Arc::new(
        SqsQueueClient::from_env(&config.queue.region, config.queue.endpoint_url.as_deref()).await,
    );

    let shutdown = CancellationToken::new();
    tally_core::signal::spawn_shutdown_handler(shutdown.clone());

    let server_shutdown = CancellationToken::new();
    let server = tally_core::init_metrics(
        &config.server.address,
        api::router(store.clone()),
        server_shutdown.clone(),
    )
    .await?;
    info!(address = %config.server.address, "HTTP server listening");

    let engine = Engine::new(queue, store, &config, shutdown.clone());
    let result = engine.run().await;

    server_shutdown.cancel();
    if let Err(e) = server.await {
        warn!(error = %e, "HTTP server task failed");
    }
    result
}
