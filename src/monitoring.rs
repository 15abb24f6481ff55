//! Health and metrics HTTP surface.

use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tracing::warn;

/// Build the monitoring router: `/healthz` and `/metrics`
pub fn router() -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
}

/// Bind and serve the monitoring surface until the process exits
pub async fn serve(bind_address: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed binding monitoring address {addr}: {e}"))?;
    tracing::info!(addr = %addr, "listening monitoring services");
    axum::serve(listener, router())
        .await
        .map_err(|e| anyhow::anyhow!("monitoring server failed: {e}"))?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics() -> String {
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&families, &mut buffer) {
        warn!(error = %e, "failed encoding metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}
