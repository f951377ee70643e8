use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::json;

use super::{ApiResponse, error_response};
use crate::core::engine::Engine;

#[derive(Deserialize)]
pub struct MessagesQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

/// GET /conversations/{id}/messages?limit=N returns the most recent N messages in
/// sequence order.
pub async fn recent_messages(
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
    State(engine): State<Arc<Engine>>,
) -> ApiResponse {
    match engine.memory.recent(&id, query.limit.clamp(1, 200)).await {
        Ok(messages) => (
            StatusCode::OK,
            Json(json!({ "conversation_id": id, "messages": messages })),
        ),
        Err(e) => error_response(&e),
    }
}
