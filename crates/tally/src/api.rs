//! Read-only HTTP API over the aggregate store.
//!
//! Served next to `/metrics` on the same listener.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use serde_json::json;
use tracing::error;

use crate::error::StoreError;
use crate::store::{AggregateStats, StoreRef};

/// Statistics for one event type as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsResponse {
    pub event_type: String,
    pub count: f64,
    pub sum: f64,
    pub average: f64,
}

impl StatsResponse {
    fn new(event_type: String, stats: AggregateStats) -> Self {
        Self {
            event_type,
            count: stats.count,
            sum: stats.sum,
            average: stats.average(),
        }
    }
}

/// Routes for `/`, `/health`, `/stats` and `/stats/{event_type}`.
pub fn router(store: StoreRef) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/stats", get(all_stats))
        .route("/stats/{event_type}", get(stats_for_type))
        .with_state(store)
}

struct ApiError(StoreError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "Store query failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": "Internal server error" })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError(e)
    }
}

async fn index() -> Json<serde_json::Value> {
    Json(json!({ "message": "Welcome to the tally stats API" }))
}

async fn health(State(store): State<StoreRef>) -> Response {
    if store.ping().await {
        Json(json!({ "status": "healthy", "store": "healthy" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "store": "unhealthy" })),
        )
            .into_response()
    }
}

async fn all_stats(State(store): State<StoreRef>) -> Result<Json<Vec<StatsResponse>>, ApiError> {
    let all = store.get_all().await?;
    Ok(Json(
        all.into_iter()
            .map(|(event_type, stats)| StatsResponse::new(event_type, stats))
            .collect(),
    ))
}

async fn stats_for_type(
    State(store): State<StoreRef>,
    Path(event_type): Path<String>,
) -> Result<Json<StatsResponse>, ApiError> {
    let stats = store.get(&event_type).await?.unwrap_or_default();
    Ok(Json(StatsResponse::new(event_type, stats)))
}
