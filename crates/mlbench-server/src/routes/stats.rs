//! Health and system limits.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use mlbench_core::{FormLimits, RunState};

use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(get_health))
        .route("/limits", get(get_limits))
}

/// GET /api/health: liveness plus run counts per state.
async fn get_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let runs = state.orchestrator.runs();
    let mut by_state = serde_json::Map::new();
    for s in RunState::ALL {
        let count = runs.iter().filter(|r| r.state == s).count();
        by_state.insert(s.to_string(), count.into());
    }
    let releasing = runs.iter().filter(|r| !r.resources_released()).count();

    Json(serde_json::json!({
        "status": "ok",
        "runs": runs.len(),
        "states": by_state,
        "teardownsPending": releasing,
        "livePools": state.orchestrator.pools().live_pools(),
    }))
}

/// GET /api/limits: ceilings for the run form.
async fn get_limits(State(state): State<Arc<AppState>>) -> Json<FormLimits> {
    Json(state.config.form_limits())
}
