pub mod agents;
pub mod conversations;
pub mod research;
pub mod tasks;
pub mod webhooks;

use axum::Json;
use axum::http::StatusCode;
use serde_json::{Value, json};

use crate::core::orchestrator::types::Task;
use crate::error::{EngineError, status_for_kind};

pub type ApiResponse = (StatusCode, Json<Value>);

pub fn error_response(e: &EngineError) -> ApiResponse {
    (
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(json!({ "error": { "kind": e.kind(), "message": e.to_string() } })),
    )
}

/// Error response for a task that reached Failed; the stored error record
/// carries the kind tag that picks the status code.
pub fn failed_task_response(task: &Task) -> ApiResponse {
    let record: Value = task
        .error
        .as_deref()
        .and_then(|e| serde_json::from_str(e).ok())
        .unwrap_or_else(|| json!({ "kind": "internal", "message": task.error }));
    let kind = record["kind"].as_str().unwrap_or("internal");
    (
        StatusCode::from_u16(status_for_kind(kind)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(json!({ "task_id": task.id, "error": record })),
    )
}

/// Public JSON shape of a task record.
pub fn task_json(task: &Task) -> Value {
    json!({
        "task_id": task.id,
        "requester_id": task.requester_id,
        "agent_id": task.agent_id,
        "state": task.state.as_str(),
        "inputs": task.inputs,
        "output": task.output.as_deref().and_then(|o| serde_json::from_str::<Value>(o).ok()),
        "error": task.error.as_deref().and_then(|e| serde_json::from_str::<Value>(e).ok())
            .or_else(|| task.error.clone().map(Value::String)),
        "created_at": task.created_at,
        "completed_at": task.completed_at,
        "parent_id": task.parent_id,
        "conversation_id": task.conversation_id,
    })
}
