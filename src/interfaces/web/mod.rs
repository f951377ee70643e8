//! HTTP surface: agent submits, research, task lookup and cancel,
//! conversation reads, and the webhook ingress endpoints.

pub mod handlers;
mod router;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::core::engine::Engine;

pub use router::build_router;

/// Bind and serve until ctrl-c, then run the engine's graceful shutdown.
pub async fn serve(engine: Arc<Engine>) -> Result<()> {
    let addr = format!("{}:{}", engine.settings.bind_addr, engine.settings.port);
    let app = build_router(engine.clone());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("crewd listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    engine.shutdown().await;
    Ok(())
}
