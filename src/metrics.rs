use anyhow::Result;
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and register metric descriptions.
/// Must be called once, before any metric is emitted.
pub fn init() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    describe_counter!(
        "gateway_http_requests_total",
        "Total number of HTTP requests"
    );
    describe_histogram!(
        "gateway_http_request_duration_seconds",
        "HTTP request duration in seconds"
    );
    describe_gauge!("gateway_active_connections", "Number of in-flight requests");
    describe_counter!("gateway_cache_hits_total", "Total number of cache hits");
    describe_counter!("gateway_cache_misses_total", "Total number of cache misses");
    describe_counter!("gateway_proxy_errors_total", "Total number of proxy errors");
    describe_gauge!(
        "gateway_circuit_breaker_state",
        "Circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "gateway_rate_limited_total",
        "Requests rejected by the rate limiter"
    );
    describe_counter!(
        "gateway_dropped_access_logs_total",
        "Access log records dropped due to queue overflow"
    );
    describe_gauge!(
        "gateway_websocket_clients",
        "Number of connected WebSocket clients"
    );

    Ok(handle)
}

pub fn record_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    counter!(
        "gateway_http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
    histogram!(
        "gateway_http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string(),
    )
    .record(duration_secs);
}

pub fn inc_in_flight() {
    gauge!("gateway_active_connections").increment(1.0);
}

pub fn dec_in_flight() {
    gauge!("gateway_active_connections").decrement(1.0);
}

pub fn record_cache_hit() {
    counter!("gateway_cache_hits_total").increment(1);
}

pub fn record_cache_miss() {
    counter!("gateway_cache_misses_total").increment(1);
}

pub fn record_proxy_error(target: &str, reason: &'static str) {
    counter!(
        "gateway_proxy_errors_total",
        "target" => target.to_string(),
        "reason" => reason,
    )
    .increment(1);
}

pub fn record_rate_limited() {
    counter!("gateway_rate_limited_total").increment(1);
}
