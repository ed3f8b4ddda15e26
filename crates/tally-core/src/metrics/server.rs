//! Prometheus recorder and HTTP server.
//!
//! The recorder is a process-wide singleton. The HTTP server exposes
//! `/metrics` and merges in whatever application routes the caller supplies
//! (the stats read API and readiness endpoint live in the `tally` crate).

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{
    AddressParseSnafu, AlreadyInitializedSnafu, BindSnafu, MetricsError, MetricsSnafu,
    NotInitializedSnafu, PrometheusInitSnafu, SetupError,
};

/// Default HTTP server address.
pub const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:8000";

/// Histogram buckets for duration metrics (in seconds). The upper buckets
/// cover a full long-poll wait.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0,
];

static CONTROLLER: OnceLock<MetricsController> = OnceLock::new();

/// Access to the installed Prometheus recorder.
pub struct MetricsController {
    handle: PrometheusHandle,
}

impl MetricsController {
    /// Get a reference to the global metrics controller.
    pub fn get() -> Result<&'static Self, MetricsError> {
        CONTROLLER.get().context(NotInitializedSnafu)
    }

    /// Render metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn install_recorder() -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .expect("valid bucket configuration")
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    CONTROLLER
        .set(MetricsController { handle })
        .map_err(|_| AlreadyInitializedSnafu.build())
}

/// Install the recorder and start the HTTP server on `address`.
///
/// `routes` are merged next to `/metrics`. The server stops when `shutdown`
/// is cancelled.
pub async fn init_global(
    address: &str,
    routes: Router,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, SetupError> {
    let addr: SocketAddr = address.parse().context(AddressParseSnafu { address })?;
    install_recorder().context(MetricsSnafu)?;
    serve(addr, routes, shutdown).await
}

/// Install the recorder for tests, tolerating repeated and concurrent calls.
pub fn init_test() {
    if install_recorder().is_err() {
        // Another thread is initializing. Wait for it to complete.
        while CONTROLLER.get().is_none() {
            std::hint::spin_loop();
        }
    }
}

/// Bind `addr` and serve `routes` plus `/metrics` in a background task.
pub async fn serve(
    addr: SocketAddr,
    routes: Router,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, SetupError> {
    let controller = MetricsController::get().context(MetricsSnafu)?;

    let app = routes
        .route("/metrics", get(metrics_handler))
        .layer(Extension(controller.handle.clone()));

    let listener = TcpListener::bind(addr)
        .await
        .context(BindSnafu { address: addr })?;

    info!(%addr, "HTTP server started");

    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!("HTTP server error: {}", e);
        }
    }))
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}
