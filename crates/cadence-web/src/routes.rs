//! Web routes.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State},
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;

use cadence_scheduler::{Context, Run, RunQuery, RunStatus, Task};

use crate::error::WebError;
use crate::sse::create_sse_stream;

/// Shared state for the web server.
pub struct AppState {
    pub context: Arc<Context>,
}

/// Create the web router.
pub fn create_router(context: Arc<Context>) -> Router {
    let state = Arc::new(AppState { context });

    Router::new()
        .route("/health", get(health))
        .route("/events", get(events))
        .route("/tasks", get(list_tasks))
        .route("/runs", get(list_runs))
        .route("/runs/{uuid}", get(get_run))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "backend": state.context.runner.backend().name(),
        "subscribers": state.context.events.subscriber_count(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn events(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    create_sse_stream(state.context.events.subscribe())
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Task>>, WebError> {
    Ok(Json(state.context.storage.get_tasks().await?))
}

#[derive(Debug, Deserialize)]
struct RunsParams {
    status: Option<String>,
    task: Option<String>,
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunsParams>,
) -> Result<Json<Vec<Run>>, WebError> {
    let status = params
        .status
        .map(|s| s.parse::<RunStatus>())
        .transpose()
        .map_err(WebError::BadRequest)?;
    let query = RunQuery {
        status,
        task_name: params.task,
    };
    Ok(Json(state.context.storage.get_runs(query).await?))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> Result<Json<Run>, WebError> {
    Ok(Json(state.context.storage.get_run(&uuid).await?))
}
