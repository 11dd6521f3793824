//! Metrics posted by workers and read back by the dashboard.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use mlbench_core::RunId;
use mlbench_runtime::{Metric, MetricsOverview, NewMetric};
use serde::Deserialize;

use crate::error::ApiResult;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/metrics", get(list_metrics).post(post_metric))
        .route("/metrics/{run_id}", get(get_metrics))
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    since: Option<DateTime<Utc>>,
    worker: Option<String>,
}

/// GET /api/metrics: every metric, grouped per run and per worker.
async fn list_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsOverview> {
    Json(state.orchestrator.metrics_overview())
}

/// POST /api/metrics
async fn post_metric(
    State(state): State<Arc<AppState>>,
    Json(metric): Json<NewMetric>,
) -> ApiResult<(StatusCode, Json<Metric>)> {
    let stored = state.orchestrator.record_metric(metric)?;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// GET /api/metrics/{run_id}?since=<rfc3339>&worker=<name>: grouped by name, sorted by date.
async fn get_metrics(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Query(query): Query<MetricsQuery>,
) -> ApiResult<Json<BTreeMap<String, Vec<Metric>>>> {
    let run_id: RunId = run_id.parse()?;
    Ok(Json(state.orchestrator.metrics(
        &run_id,
        query.since,
        query.worker.as_deref(),
    )?))
}
