//! Generic polling loop trait and runner.
//!
//! The loop fetches work, processes it, and either polls again immediately
//! (work was done) or sleeps for the idle interval. Errors are logged and
//! followed by the idle sleep; they never end the loop. Only cancellation of
//! the shutdown token does.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::emit;
use crate::metrics::events::{BatchCompleted, BatchDuration, BatchResultType};

/// Result of a single processing iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationResult {
    /// The iteration ran to completion; the count of items fully processed.
    Processed(usize),
    /// No items were available to process.
    NoItems,
    /// Shutdown was observed part-way through the iteration.
    Shutdown,
}

/// Trait for implementing a polling-based processor.
#[async_trait]
pub trait PollingProcessor: Send {
    /// The work fetched for one iteration.
    type State: Send;
    /// The error type for this processor.
    type Error: std::error::Error + Send;

    /// Fetch work for an iteration, or `None` if there is nothing to do.
    ///
    /// This may block (e.g. a long poll) and is raced against shutdown.
    async fn prepare(&mut self) -> Result<Option<Self::State>, Self::Error>;

    /// Process the fetched work.
    ///
    /// Not raced against shutdown: implementations check the token between
    /// items so that an item in progress always completes.
    async fn process(&mut self, state: Self::State) -> Result<IterationResult, Self::Error>;

    /// Hook invoked before each idle sleep.
    async fn on_idle(&mut self) {}
}

/// Run the polling loop until `shutdown` is cancelled.
///
/// `name` identifies the processor in log messages.
pub async fn run_polling_loop<P: PollingProcessor>(
    processor: &mut P,
    idle_sleep: Duration,
    shutdown: CancellationToken,
    name: &str,
) {
    loop {
        if shutdown.is_cancelled() {
            info!(target = name, "Shutdown requested, leaving polling loop");
            break;
        }

        let iteration_start = Instant::now();

        let prepared = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(target = name, "Shutdown requested while waiting for work");
                break;
            }

            result = processor.prepare() => result,
        };

        let outcome = match prepared {
            Ok(Some(state)) => processor.process(state).await,
            Ok(None) => Ok(IterationResult::NoItems),
            Err(e) => Err(e),
        };

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                error!(target = name, error = %e, "Iteration failed");
                emit!(BatchCompleted {
                    result: BatchResultType::Failed,
                });
                IterationResult::NoItems
            }
        };

        emit!(BatchDuration {
            duration: iteration_start.elapsed(),
        });

        match result {
            IterationResult::Shutdown => {
                emit!(BatchCompleted {
                    result: BatchResultType::Idle,
                });
                info!(target = name, "Shutdown requested during processing");
                break;
            }
            IterationResult::Processed(count) if count > 0 => {
                emit!(BatchCompleted {
                    result: BatchResultType::Processed,
                });
                debug!(target = name, count, "Iteration complete, polling again");
                continue;
            }
            IterationResult::Processed(_) => {
                emit!(BatchCompleted {
                    result: BatchResultType::Idle,
                });
            }
            IterationResult::NoItems => {}
        }

        processor.on_idle().await;

        debug!(
            target = name,
            "Nothing processed, waiting {}ms before next poll",
            idle_sleep.as_millis()
        );
        if shutdown
            .run_until_cancelled(tokio::time::sleep(idle_sleep))
            .await
            .is_none()
        {
            info!(target = name, "Shutdown requested during idle wait");
            break;
        }
    }
}
