//! Local health endpoint.
//!
//! Serves `GET /healthz` on the configured port, loopback only, and winds
//! down with the root cancellation token.

use axum::{Json, Router, routing::get};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Serve the health endpoint until the token cancels.
pub async fn serve(port: u16, cancel: CancellationToken) -> anyhow::Result<()> {
    let app = Router::new().route("/healthz", get(healthz));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    tracing::info!(port, "health endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
