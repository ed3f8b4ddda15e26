//! Signal handling for graceful shutdown.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for a shutdown signal (SIGINT or SIGTERM; Ctrl-C elsewhere).
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt()).expect("SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("SIGTERM handler");

    tokio::select! {
        _ = interrupt.recv() => info!(signal = "SIGINT", "Termination signal received"),
        _ = terminate.recv() => info!(signal = "SIGTERM", "Termination signal received"),
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!(signal = "ctrl-c", "Termination signal received");
}

/// Cancel `shutdown` when a termination signal arrives.
///
/// A second signal after the first is logged but otherwise ignored; the
/// processor always finishes the message it is working on.
pub fn spawn_shutdown_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down gracefully, finishing in-flight message");
        shutdown.cancel();

        shutdown_signal().await;
        warn!("Shutdown already in progress");
    });
}
