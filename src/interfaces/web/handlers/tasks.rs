use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;

use super::{ApiResponse, error_response, task_json};
use crate::core::engine::Engine;

/// GET /tasks/{id}
pub async fn get_task(
    Path(id): Path<String>,
    State(engine): State<Arc<Engine>>,
) -> ApiResponse {
    match engine.orchestrator.get(&id).await {
        Ok(task) => (StatusCode::OK, Json(task_json(&task))),
        Err(e) => error_response(&e),
    }
}

/// DELETE /tasks/{id} cancels the task.
pub async fn cancel_task(
    Path(id): Path<String>,
    State(engine): State<Arc<Engine>>,
) -> ApiResponse {
    match engine.orchestrator.cancel(&id).await {
        Ok(task) => (StatusCode::OK, Json(task_json(&task))),
        Err(e) => error_response(&e),
    }
}
