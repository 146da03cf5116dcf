//! Prometheus metrics for the worker.
//!
//! Metrics include:
//! - messages processed per job and status
//! - publish outcomes per topic
//! - back-pressure events per job
//! - per-stage pipeline usage (mean resident messages)

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge_vec, register_int_counter_vec, Encoder, GaugeVec, IntCounterVec, TextEncoder,
};
use tracing::{error, info};

// ============================================
// METRIC DEFINITIONS
// ============================================

static MESSAGES_PROCESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "conveyor_messages_processed_total",
        "Messages fully processed per job and outcome",
        &["job", "pipeline", "status"]
    )
    .expect("Failed to create messages_processed metric")
});

static PUBLISH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "conveyor_publish_total",
        "Publish operations per topic and outcome",
        &["topic", "status"]
    )
    .expect("Failed to create publish_total metric")
});

static BACKPRESSURE_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "conveyor_backpressure_events_total",
        "Number of times a job's polling was parked",
        &["job", "reason"]
    )
    .expect("Failed to create backpressure_events metric")
});

static PIPELINE_USAGE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "conveyor_pipeline_usage",
        "Mean number of messages resident in each stage over the collection interval",
        &["stage", "executor", "pipeline", "labels"]
    )
    .expect("Failed to create pipeline_usage metric")
});

// ============================================
// METRICS API
// ============================================

pub fn record_message_processed(job: &str, pipeline: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    MESSAGES_PROCESSED
        .with_label_values(&[job, pipeline, status])
        .inc();
}

pub fn record_publish(topic: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    PUBLISH_TOTAL.with_label_values(&[topic, status]).inc();
}

pub fn record_backpressure(job: &str, reason: &str) {
    BACKPRESSURE_EVENTS.with_label_values(&[job, reason]).inc();
}

pub fn set_pipeline_usage(stage: &str, executor: &str, pipeline: &str, labels: &str, usage: f64) {
    PIPELINE_USAGE
        .with_label_values(&[stage, executor, pipeline, labels])
        .set(usage);
}

/// Collects all metrics as Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}

// ============================================
// METRICS SERVER
// ============================================

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;

async fn handle_metrics(_req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let metrics = gather_metrics();
    Ok(Response::new(Full::new(Bytes::from(metrics))))
}

/// Starts the metrics HTTP server.
pub async fn start_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_metrics))
                .await
            {
                error!(error = %e, "Error serving metrics connection");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_metrics() {
        record_message_processed("job-1", "normalize", true);
        record_publish("out", false);
        record_backpressure("job-1", "executor_full");
        set_pipeline_usage("executing", "default", "normalize", "", 0.5);

        let metrics = gather_metrics();
        assert!(metrics.contains("conveyor_messages_processed_total"));
        assert!(metrics.contains("conveyor_publish_total"));
        assert!(metrics.contains("conveyor_backpressure_events_total"));
        assert!(metrics.contains("conveyor_pipeline_usage"));
    }
}
