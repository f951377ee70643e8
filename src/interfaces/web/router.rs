use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};

use super::handlers::{agents, conversations, research, tasks, webhooks};
use crate::core::engine::Engine;
use crate::core::webhooks::MAX_PAYLOAD_BYTES;

pub fn build_router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET]);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/agents/{agent_id}", post(agents::invoke))
        .route("/multi-agent", post(agents::invoke_multi))
        .route("/research", post(research::run))
        .route(
            "/tasks/{id}",
            get(tasks::get_task).delete(tasks::cancel_task),
        )
        .route(
            "/conversations/{id}/messages",
            get(conversations::recent_messages),
        )
        .route("/webhook/{endpoint}", post(webhooks::ingest))
        // Slack for the ingress path: the 2 MiB contract check runs inside
        // the handler, after signature verification, per the ingress order.
        .layer(DefaultBodyLimit::max(MAX_PAYLOAD_BYTES + 64 * 1024))
        .layer(middleware::from_fn(security_headers))
        .layer(cors)
        .with_state(engine)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    response
}
