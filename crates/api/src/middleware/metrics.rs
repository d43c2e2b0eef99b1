//! Prometheus metrics middleware.
//!
//! Provides HTTP request/response metrics collection and export, plus the
//! business series recorded by the publisher, assembler and expiry sweep.

use axum::{
    body::Body,
    extract::MatchedPath,
    http::{Method, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

/// Byte buckets for upload size histograms, 1 KiB to 1 GiB.
const UPLOAD_SIZE_BUCKETS: &[f64] = &[
    1024.0,
    16384.0,
    262_144.0,
    1_048_576.0,
    10_485_760.0,
    104_857_600.0,
    1_073_741_824.0,
];

/// Middleware to record HTTP request metrics.
///
/// Records the following metrics:
/// - `http_requests_total`: Counter with labels (method, path, status)
/// - `http_request_duration_seconds`: Histogram with labels (method, path)
pub async fn metrics_middleware(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let response = next.run(req).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();
    let method_str = method_to_str(&method);

    counter!(
        "http_requests_total",
        "method" => method_str.to_string(),
        "path" => path.clone(),
        "status" => status
    )
    .increment(1);

    histogram!(
        "http_request_duration_seconds",
        "method" => method_str.to_string(),
        "path" => path
    )
    .record(duration);

    response
}

/// Convert HTTP method to string for metric labels.
fn method_to_str(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::DELETE => "DELETE",
        Method::PATCH => "PATCH",
        Method::HEAD => "HEAD",
        Method::OPTIONS => "OPTIONS",
        _ => "OTHER",
    }
}

/// A message was acknowledged by the broker.
pub fn record_message_published(topic: &str, duration_secs: f64) {
    counter!("messages_published", "topic" => topic.to_string()).increment(1);
    histogram!("publish_seconds", "topic" => topic.to_string()).record(duration_secs);
}

/// The broker rejected a message, or the client refused it.
pub fn record_publish_failure(topic: &str) {
    counter!("publish_failures", "topic" => topic.to_string()).increment(1);
}

/// A message was dropped after its last delivery attempt.
pub fn record_dead_letter(topic: &str) {
    counter!("publish_dead_letters", "topic" => topic.to_string()).increment(1);
}

/// Records one per-source upload to the object store.
pub fn record_source_upload(account: &str, org_id: &str, application: &str, size: Option<u64>) {
    counter!("total_s3_uploads").increment(1);
    match size {
        Some(bytes) => histogram!(
            "export_upload_sizes",
            "account" => account.to_string(),
            "org_id" => org_id.to_string(),
            "app" => application.to_string()
        )
        .record(bytes as f64),
        None => counter!("failed_s3_uploads").increment(1),
    }
}

pub fn record_expired_deleted(count: u64) {
    counter!("expired_exports_deleted").increment(count);
}

/// Handler for /metrics endpoint that returns Prometheus text format.
pub async fn metrics_handler() -> impl IntoResponse {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        let output = handle.render();
        (
            axum::http::StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            output,
        )
    } else {
        (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            [(axum::http::header::CONTENT_TYPE, "text/plain")],
            "Metrics not initialized".to_string(),
        )
    }
}

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once during application startup before any metrics are
/// recorded. A second call is a no-op.
pub fn init_metrics() -> Result<(), BuildError> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets(&[0.001, 0.005, 0.01, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0])?
        .set_buckets_for_metric(
            Matcher::Full("export_upload_sizes".to_string()),
            UPLOAD_SIZE_BUCKETS,
        )?
        .install_recorder()?;

    let _ = PROMETHEUS_HANDLE.set(handle);
    Ok(())
}
