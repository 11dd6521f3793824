//! Run lifecycle routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use mlbench_cluster::PoolStatus;
use mlbench_core::{Run, RunId, RunSummary};
use mlbench_runtime::{CreateRunRequest, RunWorker};

use crate::error::ApiResult;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/runs", get(list_runs).post(create_run))
        .route("/runs/{id}", get(get_run).delete(delete_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/complete", post(complete_run))
        .route("/runs/{id}/workers", get(get_workers))
        .route("/workers", get(list_workers))
}

/// POST /api/runs: create a run and start provisioning it.
async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateRunRequest>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    let run = state.orchestrator.create_run(request)?;
    Ok((StatusCode::CREATED, Json(run)))
}

/// GET /api/runs: id, name and state of every run.
async fn list_runs(State(state): State<Arc<AppState>>) -> Json<Vec<RunSummary>> {
    Json(state.orchestrator.list_runs())
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Run>> {
    let id: RunId = id.parse()?;
    Ok(Json(state.orchestrator.get_run(&id)?))
}

/// POST /api/runs/{id}/cancel: acknowledged immediately, teardown continues in the background.
async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    let id: RunId = id.parse()?;
    let run = state.orchestrator.cancel_run(&id)?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

/// POST /api/runs/{id}/complete: completion signal from the workload.
async fn complete_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Run>> {
    let id: RunId = id.parse()?;
    Ok(Json(state.orchestrator.complete_run(&id)?))
}

async fn delete_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id: RunId = id.parse()?;
    state.orchestrator.delete_run(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/runs/{id}/workers: live pool status.
async fn get_workers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<PoolStatus>> {
    let id: RunId = id.parse()?;
    Ok(Json(state.orchestrator.pool_status(&id).await?))
}

/// GET /api/workers: workers of every run, tagged with their run.
async fn list_workers(State(state): State<Arc<AppState>>) -> Json<Vec<RunWorker>> {
    Json(state.orchestrator.list_workers().await)
}
