use crate::SharedMetrics;
use anyhow::{Context, Result};
use axum::{Router, extract::State, http::StatusCode, routing::get};
use std::future::Future;
use std::net::SocketAddr;
use tracing::{info, warn};

async fn scrape(State(metrics): State<SharedMetrics>) -> Result<String, StatusCode> {
    metrics.gather().map_err(|error| {
        warn!(%error, "Failed to encode sync metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Routes served by the exporter: `/metrics` for Prometheus scrapes.
pub fn router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(scrape))
        .with_state(metrics)
}

/// Serves sync metrics on `addr` until `shutdown` resolves.
pub async fn serve_metrics(
    addr: SocketAddr,
    metrics: SharedMetrics,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    info!(%addr, "Metrics exporter listening");

    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(shutdown)
        .await
        .context("metrics exporter failed")
}
