//! The processing engine.
//!
//! [`Engine::run`] drives the service lifecycle:
//!
//! ```text
//! Starting -> WaitingForStore -> Running -> ShuttingDown -> Stopped
//! ```
//!
//! The store must answer a ping before anything touches the queue. Once it
//! does, queues are provisioned and batch cycles run until the shutdown
//! token is cancelled. Only an unreachable store at startup ends the process
//! with an error.

mod batch;
mod startup;

pub use batch::{BatchOutcome, BatchProcessor, BatchSettings};
pub use startup::{provision_queues, wait_for_store};

use std::fmt;
use std::time::Duration;

use tally_core::emit;
use tally_core::polling::run_polling_loop;
use tally_core::ExponentialBackoff;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::TallyConfig;
use crate::dlq::DeadLetterCoordinator;
use crate::error::StartupError;
use crate::metrics::LifecycleTransition;
use crate::queue::QueueClient;
use crate::store::AggregateStore;

/// Where the engine is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    WaitingForStore,
    Running,
    ShuttingDown,
    Stopped,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Starting => "starting",
            Lifecycle::WaitingForStore => "waiting_for_store",
            Lifecycle::Running => "running",
            Lifecycle::ShuttingDown => "shutting_down",
            Lifecycle::Stopped => "stopped",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings the engine needs beyond the batch cycle itself.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub batch: BatchSettings,
    pub idle_sleep: Duration,
    pub store_connect_attempts: u32,
    pub backoff: ExponentialBackoff,
}

impl From<&TallyConfig> for EngineSettings {
    fn from(config: &TallyConfig) -> Self {
        Self {
            batch: BatchSettings {
                receive: config.receive_options(),
                max_receive_count: config.queue.max_receive_count,
                visibility_extension_threshold: config.processor.visibility_extension_threshold,
                dlq_check_interval: config.processor.dlq_check_interval(),
            },
            idle_sleep: config.processor.idle_sleep(),
            store_connect_attempts: config.store.connect_attempts,
            backoff: config.store.backoff(),
        }
    }
}

/// Owns the queue and store handles and runs the processing lifecycle.
pub struct Engine<Q, S> {
    queue: Q,
    store: S,
    coordinator: DeadLetterCoordinator<Q>,
    settings: EngineSettings,
    shutdown: CancellationToken,
    lifecycle: watch::Sender<Lifecycle>,
}

impl<Q, S> Engine<Q, S>
where
    Q: QueueClient + Clone,
    S: AggregateStore,
{
    pub fn new(queue: Q, store: S, config: &TallyConfig, shutdown: CancellationToken) -> Self {
        Self::with_settings(
            queue.clone(),
            store,
            DeadLetterCoordinator::new(queue, config.queue.clone()),
            EngineSettings::from(config),
            shutdown,
        )
    }

    pub fn with_settings(
        queue: Q,
        store: S,
        coordinator: DeadLetterCoordinator<Q>,
        settings: EngineSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Starting);
        Self {
            queue,
            store,
            coordinator,
            settings,
            shutdown,
            lifecycle,
        }
    }

    /// Observe lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    /// Run until shutdown.
    ///
    /// Returns an error only when the store never became reachable.
    pub async fn run(self) -> Result<(), StartupError> {
        let Self {
            queue,
            store,
            coordinator,
            settings,
            shutdown,
            lifecycle,
        } = self;
        let transition = |next: Lifecycle| set_lifecycle(&lifecycle, next);

        transition(Lifecycle::WaitingForStore);
        let ready = wait_for_store(
            &store,
            settings.store_connect_attempts,
            &settings.backoff,
            &shutdown,
        )
        .await;
        match ready {
            Ok(true) => {}
            Ok(false) => {
                transition(Lifecycle::Stopped);
                return Ok(());
            }
            Err(e) => {
                transition(Lifecycle::Stopped);
                return Err(e);
            }
        }

        let Some(urls) = provision_queues(&coordinator, &settings.backoff, &shutdown).await else {
            transition(Lifecycle::Stopped);
            return Ok(());
        };

        let mut processor =
            BatchProcessor::new(queue, store, urls, settings.batch, shutdown.clone())
                .with_dlq_monitor(coordinator);

        transition(Lifecycle::Running);
        let watch_shutdown = async {
            shutdown.cancelled().await;
            transition(Lifecycle::ShuttingDown);
        };
        tokio::join!(
            run_polling_loop(&mut processor, settings.idle_sleep, shutdown.clone(), "processor"),
            watch_shutdown,
        );

        transition(Lifecycle::Stopped);
        info!("Processor stopped");
        Ok(())
    }
}

fn set_lifecycle(lifecycle: &watch::Sender<Lifecycle>, next: Lifecycle) {
    let previous = lifecycle.send_replace(next);
    if previous != next {
        info!(from = %previous, to = %next, "Lifecycle transition");
        emit!(LifecycleTransition {
            state: next.as_str(),
        });
    }
}
