use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Register descriptions for the dispatcher's metrics.
pub fn describe_metrics() {
    metrics::describe_counter!("alert_jobs_claimed_total", "Alert jobs claimed from the queue");
    metrics::describe_counter!("alert_deliveries_total", "Plate hits accepted by the receiver");
    metrics::describe_counter!(
        "alert_delivery_failures_total",
        "Delivery attempts that failed and were recorded for retry"
    );
    metrics::describe_counter!("alert_jobs_dead_total", "Alert jobs dead-lettered");
    metrics::describe_counter!(
        "alert_presign_failures_total",
        "Image links left empty because presigning failed"
    );
    metrics::describe_counter!(
        "alert_resubscribe_failures_total",
        "Failed attempts to (re)establish the push subscription"
    );
    metrics::describe_histogram!(
        "alert_delivery_seconds",
        "Time spent posting one plate hit to the receiver"
    );
}

/// GET /metrics — Prometheus text exposition.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
