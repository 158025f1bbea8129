//! Prometheus metrics HTTP endpoint
//!
//! Exposes device metrics in Prometheus text format at /metrics and a JSON
//! status snapshot at /status. Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::orchestrator::StatusSources;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with device label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    device: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{device=\"{device}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    device: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{device=\"{device}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{device=\"{device}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{device=\"{device}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{device=\"{device}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, device_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_input_metrics(&mut output, device_id, &summary);
    write_fusion_metrics(&mut output, device_id, &summary);
    write_store_metrics(&mut output, device_id, &summary);
    write_delivery_metrics(&mut output, device_id, &summary);

    output
}

fn write_input_metrics(output: &mut String, device: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "pothole_readings_accepted_total",
        "Sensor readings and detection batches accepted by the fusion engine",
        MetricType::Counter,
        device,
        summary.readings_accepted,
    );
    write_metric(
        output,
        "pothole_readings_dropped_total",
        "Malformed or out-of-order inputs discarded",
        MetricType::Counter,
        device,
        summary.readings_dropped,
    );
    write_metric(
        output,
        "pothole_inputs_channel_full_total",
        "Inputs lost because the fusion channel was full",
        MetricType::Counter,
        device,
        summary.inputs_dropped_channel_full,
    );
    write_metric(
        output,
        "pothole_detector_runs_total",
        "Detector invocations",
        MetricType::Counter,
        device,
        summary.detector_runs,
    );
    write_metric(
        output,
        "pothole_detector_failures_total",
        "Detector errors and timeouts",
        MetricType::Counter,
        device,
        summary.detector_failures,
    );
}

fn write_fusion_metrics(output: &mut String, device: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "pothole_windows_opened_total",
        "Incident windows opened",
        MetricType::Counter,
        device,
        summary.windows_opened,
    );
    write_metric(
        output,
        "pothole_windows_expired_total",
        "Incident windows that timed out without confirmation",
        MetricType::Counter,
        device,
        summary.windows_expired,
    );
    write_metric(
        output,
        "pothole_events_confirmed_total",
        "Confirmed pothole events",
        MetricType::Counter,
        device,
        summary.events_confirmed,
    );
}

fn write_store_metrics(output: &mut String, device: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "pothole_events_enqueued_total",
        "Events accepted by the store",
        MetricType::Counter,
        device,
        summary.events_enqueued,
    );
    write_metric(
        output,
        "pothole_store_write_failures_total",
        "Failed store writes (event held in memory)",
        MetricType::Counter,
        device,
        summary.store_write_failures,
    );
    write_metric(
        output,
        "pothole_overflow_evictions_total",
        "Events evicted from the overflow buffer (data loss)",
        MetricType::Counter,
        device,
        summary.overflow_evictions,
    );
    write_metric(
        output,
        "pothole_pending_events",
        "Events awaiting delivery",
        MetricType::Gauge,
        device,
        summary.pending_depth,
    );
    write_metric(
        output,
        "pothole_dead_letter_events",
        "Events moved to dead-letter",
        MetricType::Gauge,
        device,
        summary.dead_letter_depth,
    );
}

fn write_delivery_metrics(output: &mut String, device: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "pothole_uploads_delivered_total",
        "Events delivered to the backend",
        MetricType::Counter,
        device,
        summary.uploads_delivered,
    );
    write_metric(
        output,
        "pothole_upload_failures_total",
        "Failed delivery attempts",
        MetricType::Counter,
        device,
        summary.upload_failures,
    );
    write_metric(
        output,
        "pothole_auth_retries_total",
        "Uploads retried after an auth rejection",
        MetricType::Counter,
        device,
        summary.auth_retries,
    );
    write_metric(
        output,
        "pothole_dead_lettered_total",
        "Events dead-lettered after the attempt ceiling",
        MetricType::Counter,
        device,
        summary.dead_lettered,
    );
    write_metric(
        output,
        "pothole_delivery_worker_restarts_total",
        "Delivery worker restarts by the supervisor",
        MetricType::Counter,
        device,
        summary.worker_restarts,
    );
    write_histogram(
        output,
        "pothole_delivery_latency_ms",
        "Time from claim to confirmed delivery in milliseconds",
        device,
        &summary.delivery_latency_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.delivery_latency_avg_ms,
    );
    write_metric(
        output,
        "pothole_delivery_latency_p95_ms",
        "95th percentile delivery latency",
        MetricType::Gauge,
        device,
        summary.delivery_latency_p95_ms,
    );
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail")
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    status: Arc<StatusSources>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &status.device_id);
            Ok(text_response(StatusCode::OK, "text/plain; version=0.0.4; charset=utf-8", body))
        }
        (&Method::GET, "/status") => match serde_json::to_string(&status.snapshot()) {
            Ok(body) => Ok(text_response(StatusCode::OK, "application/json", body)),
            Err(e) => Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                e.to_string(),
            )),
        },
        (&Method::GET, "/health") => {
            Ok(text_response(StatusCode::OK, "text/plain", "ok".to_string()))
        }
        _ => Ok(text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string())),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    status: StatusSources,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let status = Arc::new(status);

    info!(port = %port, device = %status.device_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let status = status.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let status = status.clone();
                                async move { handle_request(req, metrics, status).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();

        metrics.record_event_confirmed();
        metrics.record_upload_delivered(120);
        metrics.record_upload_delivered(900);
        metrics.set_store_depths(4, 1);

        let output = format_prometheus_metrics(&metrics, "truck-7");

        assert!(output.contains("pothole_events_confirmed_total{device=\"truck-7\"} 1"));
        assert!(output.contains("pothole_uploads_delivered_total{device=\"truck-7\"} 2"));
        assert!(output.contains("pothole_pending_events{device=\"truck-7\"} 4"));
        assert!(output.contains("pothole_dead_letter_events{device=\"truck-7\"} 1"));
        assert!(output.contains("pothole_delivery_latency_ms_bucket{device=\"truck-7\",le=\"+Inf\"} 2"));
    }
}
