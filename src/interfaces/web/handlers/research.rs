use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::json;

use super::{ApiResponse, error_response, failed_task_response};
use crate::core::engine::Engine;
use crate::core::orchestrator::types::TaskState;
use crate::core::research::ResearchOutcome;

#[derive(Deserialize)]
pub struct ResearchRequest {
    pub requester_id: String,
    pub query: String,
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default)]
    pub preferred_agent: Option<String>,
}

/// POST /research. Waits out the research deadline for the synchronous
/// answer shape; a slower run falls back to 202 with the task handle.
pub async fn run(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<ResearchRequest>,
) -> ApiResponse {
    let task = match engine
        .orchestrator
        .research(
            &req.requester_id,
            &req.query,
            req.max_results,
            req.preferred_agent.as_deref(),
        )
        .await
    {
        Ok(task) => task,
        Err(e) => return error_response(&e),
    };

    let settled = match engine
        .orchestrator
        .wait(&task.id, engine.settings.research_deadline)
        .await
    {
        Ok(task) => task,
        Err(e) => return error_response(&e),
    };

    match settled.state {
        TaskState::Completed => {
            let outcome: Option<ResearchOutcome> = settled
                .output
                .as_deref()
                .and_then(|o| serde_json::from_str(o).ok());
            match outcome {
                Some(outcome) => (
                    StatusCode::OK,
                    Json(json!({
                        "task_id": settled.id,
                        "answer": outcome.answer,
                        "sources": outcome.sources,
                        "used_model": outcome.model_id,
                        "pages_synthesised": outcome.pages_synthesised,
                    })),
                ),
                None => (
                    StatusCode::OK,
                    Json(json!({ "task_id": settled.id, "answer": settled.output })),
                ),
            }
        }
        TaskState::Failed | TaskState::Cancelled => failed_task_response(&settled),
        _ => (
            StatusCode::ACCEPTED,
            Json(json!({ "task_id": settled.id })),
        ),
    }
}
