use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use serde_json::{Value, json};

use super::{ApiResponse, error_response};
use crate::core::engine::Engine;
use crate::core::webhooks::{IngestOutcome, WebhookEndpoint};
use crate::error::EngineError;

const SIGNATURE_HEADER: &str = "x-webhook-signature";

fn headers_json(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            map.insert(name.to_string(), Value::String(v.to_string()));
        }
    }
    Value::Object(map)
}

/// POST /webhook/{endpoint}: raw body, `x-webhook-signature: sha256=<hex>`.
/// The whole ingress contract runs under the ack deadline; blowing it
/// answers 503 so the sender retries.
pub async fn ingest(
    Path(endpoint): Path<String>,
    State(engine): State<Arc<Engine>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResponse {
    let Some(endpoint) = WebhookEndpoint::from_path(&endpoint) else {
        return error_response(&EngineError::NotFound(format!(
            "no webhook endpoint {endpoint}"
        )));
    };
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let outcome = tokio::time::timeout(
        engine.settings.webhook_ack_timeout,
        engine
            .ingress
            .ingest(endpoint, signature.as_deref(), headers_json(&headers), &body),
    )
    .await;

    match outcome {
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": { "kind": "timeout", "message": "ack deadline exceeded" } })),
        ),
        Ok(Ok(IngestOutcome::Accepted { task_id })) => (
            StatusCode::OK,
            Json(json!({ "status": "accepted", "task_id": task_id })),
        ),
        Ok(Ok(IngestOutcome::Duplicate)) => {
            (StatusCode::OK, Json(json!({ "status": "duplicate" })))
        }
        // A failed enqueue is the one internal error the contract turns
        // into 503 rather than 500.
        Ok(Err(EngineError::Internal(msg))) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": { "kind": "internal", "message": msg } })),
        ),
        Ok(Err(e)) => error_response(&e),
    }
}
