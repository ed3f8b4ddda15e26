//! Startup dependency checks.

use tally_core::emit;
use tally_core::metrics::events::RequestStatus;
use tally_core::ExponentialBackoff;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dlq::{DeadLetterCoordinator, QueueUrls};
use crate::error::StartupError;
use crate::metrics::StoreConnectAttempt;
use crate::queue::QueueClient;
use crate::store::AggregateStore;

/// Ping the store until it answers, backing off between attempts.
///
/// Returns `Ok(true)` once the store is reachable and `Ok(false)` if shutdown
/// was requested while waiting. Running out of attempts is an error.
pub async fn wait_for_store<S: AggregateStore + ?Sized>(
    store: &S,
    attempts: u32,
    backoff: &ExponentialBackoff,
    shutdown: &CancellationToken,
) -> Result<bool, StartupError> {
    for attempt in 0..attempts {
        if shutdown.is_cancelled() {
            return Ok(false);
        }

        if store.ping().await {
            emit!(StoreConnectAttempt {
                status: RequestStatus::Success,
            });
            info!(attempt = attempt + 1, "Aggregate store is reachable");
            return Ok(true);
        }
        emit!(StoreConnectAttempt {
            status: RequestStatus::Error,
        });

        if attempt + 1 == attempts {
            break;
        }

        let delay = backoff.delay(attempt);
        warn!(
            attempt = attempt + 1,
            attempts,
            retry_in_ms = delay.as_millis() as u64,
            "Aggregate store not reachable, retrying"
        );
        if shutdown
            .run_until_cancelled(tokio::time::sleep(delay))
            .await
            .is_none()
        {
            return Ok(false);
        }
    }

    error!(attempts, "Aggregate store unreachable, giving up");
    Err(StartupError::StoreUnavailable { attempts })
}

/// Provision queues, retrying with backoff until it succeeds.
///
/// Returns `None` only if shutdown was requested first.
pub async fn provision_queues<Q: QueueClient>(
    coordinator: &DeadLetterCoordinator<Q>,
    backoff: &ExponentialBackoff,
    shutdown: &CancellationToken,
) -> Option<QueueUrls> {
    let mut attempt = 0u32;
    loop {
        let result = shutdown.run_until_cancelled(coordinator.provision()).await?;
        match result {
            Ok(urls) => return Some(urls),
            Err(e) => {
                let delay = backoff.delay(attempt);
                warn!(
                    error = %e,
                    attempt = attempt + 1,
                    retry_in_ms = delay.as_millis() as u64,
                    "Queue provisioning failed, retrying"
                );
                shutdown
                    .run_until_cancelled(tokio::time::sleep(delay))
                    .await?;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}
