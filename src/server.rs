//! Prometheus metrics server.

use std::net::SocketAddr;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::{extract::Extension, routing::get, AddExtensionLayer, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;

const PROM_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

static RECORDER: OnceLock<PrometheusRecorder> = OnceLock::new();

/// Get a handle to the metrics recorder, initializing it as needed.
///
/// The recorder's global labels are taken from the config of the first call.
pub fn get_metrics_recorder(config: &Config) -> &'static PrometheusRecorder {
    RECORDER.get_or_init(|| {
        PrometheusBuilder::new()
            .add_global_label("namespace", config.namespace.clone())
            .add_global_label("application", config.application.clone())
            .add_global_label("flow", config.flow.clone())
            .build()
    })
}

/// Spawn the server exposing the flow's metrics on `/metrics`, until shutdown.
pub fn spawn_prom_server(config: &Config, shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let handle = get_metrics_recorder(config).handle();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    tokio::spawn(serve_metrics(addr, handle, shutdown))
}

async fn serve_metrics(addr: SocketAddr, handle: PrometheusHandle, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let app = Router::new().route("/metrics", get(render_metrics)).layer(AddExtensionLayer::new(handle));
    tracing::info!(%addr, "serving flow metrics");
    axum::Server::try_bind(&addr)
        .with_context(|| format!("error binding metrics server to {}", addr))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = shutdown.recv().await;
        })
        .await
        .context("error from metrics server")
}

async fn render_metrics(Extension(handle): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(PROM_CONTENT_TYPE));
    (StatusCode::OK, headers, handle.render())
}
