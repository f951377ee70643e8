use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{ApiResponse, error_response, failed_task_response};
use crate::core::agents::runner::RunOutcome;
use crate::core::engine::Engine;
use crate::core::orchestrator::types::{Task, TaskState};

#[derive(Deserialize)]
pub struct InvokeRequest {
    pub requester_id: String,
    pub prompt: String,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn conversation_from(context: &Option<Value>) -> Option<String> {
    context
        .as_ref()
        .and_then(|c| c.get("conversation_id"))
        .and_then(|id| id.as_str())
        .map(|id| id.to_string())
}

/// POST /agents/{agent_id}. Runs the synchronous fast-path: 200 with the
/// output when the task completes inside the window, 202 with the handle
/// otherwise.
pub async fn invoke(
    Path(agent_id): Path<String>,
    State(engine): State<Arc<Engine>>,
    Json(req): Json<InvokeRequest>,
) -> ApiResponse {
    let conversation_id = conversation_from(&req.context);
    let mut inputs = json!({ "prompt": req.prompt });
    if let Some(context) = &req.context {
        inputs["context"] = context.clone();
    }

    let task = match engine
        .orchestrator
        .submit(
            &req.requester_id,
            &agent_id,
            inputs,
            req.idempotency_key,
            conversation_id,
        )
        .await
    {
        Ok(task) => task,
        Err(e) => return error_response(&e),
    };

    settle_fast_path(&engine, task, engine.settings.agent_deadline).await
}

/// POST /multi-agent: free-text routing by @mentions.
#[derive(Deserialize)]
pub struct MultiRequest {
    pub requester_id: String,
    pub prompt: String,
    #[serde(default)]
    pub context: Option<Value>,
}

pub async fn invoke_multi(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<MultiRequest>,
) -> ApiResponse {
    let conversation_id = conversation_from(&req.context);
    let task = match engine
        .orchestrator
        .submit_multi(&req.requester_id, &req.prompt, conversation_id)
        .await
    {
        Ok(task) => task,
        Err(e) => return error_response(&e),
    };
    settle_fast_path(&engine, task, engine.settings.agent_deadline).await
}

async fn settle_fast_path(
    engine: &Arc<Engine>,
    task: Task,
    window: std::time::Duration,
) -> ApiResponse {
    let settled = match engine.orchestrator.wait(&task.id, window).await {
        Ok(task) => task,
        Err(e) => return error_response(&e),
    };

    match settled.state {
        TaskState::Completed => {
            let outcome: Option<RunOutcome> = settled
                .output
                .as_deref()
                .and_then(|o| serde_json::from_str(o).ok());
            match outcome {
                Some(outcome) => (
                    StatusCode::OK,
                    Json(json!({
                        "task_id": settled.id,
                        "output": outcome.text,
                        "used_model": outcome.used_model,
                        "delegations": outcome.delegations,
                    })),
                ),
                None => (
                    StatusCode::OK,
                    Json(json!({
                        "task_id": settled.id,
                        "output": settled.output,
                        "used_model": Value::Null,
                        "delegations": [],
                    })),
                ),
            }
        }
        TaskState::Failed | TaskState::Cancelled => failed_task_response(&settled),
        // Still queued or running when the window closed.
        _ => (
            StatusCode::ACCEPTED,
            Json(json!({ "task_id": settled.id })),
        ),
    }
}
