// observability/metrics.rs - Prometheus Metrics

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for metrics
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Address to expose metrics endpoint
    pub listen_addr: SocketAddr,

    /// Histogram buckets for KB operation latency (in seconds)
    pub kb_op_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9108".parse().expect("static addr"),
            kb_op_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ],
        }
    }
}

/// Handle to the Prometheus metrics exporter
#[derive(Clone)]
pub struct MetricsHandle {
    handle: PrometheusHandle,
}

impl MetricsHandle {
    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Knowledge-base metrics
pub struct KbMetrics;

impl KbMetrics {
    pub const STORE_OK: &'static str = "kb_store_ok";
    pub const STORE_CONFLICT: &'static str = "kb_store_conflict";
    pub const STORE_FAIL: &'static str = "kb_store_fail";
    pub const GET_OK: &'static str = "kb_get_ok";
    pub const GET_NOT_FOUND: &'static str = "kb_get_not_found";
    pub const GET_FAIL: &'static str = "kb_get_fail";
    pub const OP_SECONDS: &'static str = "kb_op_seconds";
}

/// Bus traffic metrics
pub struct MessageMetrics;

impl MessageMetrics {
    pub const SENT_TOTAL: &'static str = "mas_messages_sent_total";
    pub const RECEIVED_TOTAL: &'static str = "mas_messages_received_total";
}

/// Coordinator metrics
pub struct CoordinatorMetrics;

impl CoordinatorMetrics {
    pub const CONVERSATIONS_TOTAL: &'static str = "mas_conversations_served_total";
}

/// STORE outcome classes for the counters
#[derive(Debug, Clone, Copy)]
pub enum KbStoreOutcome {
    Ok,
    Conflict,
    Fail,
}

/// GET outcome classes for the counters
#[derive(Debug, Clone, Copy)]
pub enum KbGetOutcome {
    Ok,
    NotFound,
    Fail,
}

/// Initialize the metrics system
///
/// Starts an HTTP server on the configured address to expose Prometheus
/// metrics. Returns a handle that can be used to render metrics
/// programmatically.
pub fn init_metrics(config: MetricsConfig) -> Result<MetricsHandle, Box<dyn std::error::Error>> {
    let builder = PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full(KbMetrics::OP_SECONDS.into()),
        &config.kb_op_buckets,
    )?;

    let handle = builder.install_recorder()?;
    let metrics_handle = MetricsHandle { handle: handle.clone() };

    // HTTP server for the scrape endpoint
    let listen_addr = config.listen_addr;
    let shared_handle = std::sync::Arc::new(handle);

    tokio::spawn(async move {
        use axum::{Json, Router, http::StatusCode, routing::get};
        use serde::Serialize;

        #[derive(Serialize)]
        struct HealthResponse {
            status: &'static str,
            version: &'static str,
            uptime_secs: u64,
        }

        let start_time = std::time::Instant::now();

        let handle_for_route = shared_handle.clone();
        let app = Router::new()
            .route(
                "/metrics",
                get(move || {
                    let h = handle_for_route.clone();
                    async move { h.render() }
                }),
            )
            .route(
                "/health",
                get(move || {
                    let uptime = start_time.elapsed().as_secs();
                    async move {
                        Json(HealthResponse {
                            status: "healthy",
                            version: env!("CARGO_PKG_VERSION"),
                            uptime_secs: uptime,
                        })
                    }
                }),
            )
            .route("/ready", get(|| async { StatusCode::OK }))
            .route("/live", get(|| async { StatusCode::OK }));

        match tokio::net::TcpListener::bind(listen_addr).await {
            Ok(listener) => {
                tracing::info!(addr = %listen_addr, "Metrics HTTP server started");
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!(error = %e, "Metrics server error");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, addr = %listen_addr, "Failed to bind metrics server");
            }
        }
    });

    describe_counter!(KbMetrics::STORE_OK, "Successful STORE ops");
    describe_counter!(KbMetrics::STORE_CONFLICT, "STORE conflicts");
    describe_counter!(KbMetrics::STORE_FAIL, "STORE failures (other)");
    describe_counter!(KbMetrics::GET_OK, "Successful GET ops");
    describe_counter!(KbMetrics::GET_NOT_FOUND, "GET not found");
    describe_counter!(KbMetrics::GET_FAIL, "GET failures (other)");
    describe_histogram!(KbMetrics::OP_SECONDS, "KB operation latency");

    describe_counter!(MessageMetrics::SENT_TOTAL, "Total ACL frames sent");
    describe_counter!(MessageMetrics::RECEIVED_TOTAL, "Total ACL frames received");
    describe_counter!(
        CoordinatorMetrics::CONVERSATIONS_TOTAL,
        "Conversations served by the coordinator"
    );

    tracing::info!(addr = %config.listen_addr, "Metrics initialized");

    Ok(metrics_handle)
}

// Recording functions

/// Count one STORE outcome
pub fn record_kb_store(outcome: KbStoreOutcome) {
    match outcome {
        KbStoreOutcome::Ok => counter!(KbMetrics::STORE_OK).increment(1),
        KbStoreOutcome::Conflict => counter!(KbMetrics::STORE_CONFLICT).increment(1),
        KbStoreOutcome::Fail => counter!(KbMetrics::STORE_FAIL).increment(1),
    }
}

/// Count one GET outcome
pub fn record_kb_get(outcome: KbGetOutcome) {
    match outcome {
        KbGetOutcome::Ok => counter!(KbMetrics::GET_OK).increment(1),
        KbGetOutcome::NotFound => counter!(KbMetrics::GET_NOT_FOUND).increment(1),
        KbGetOutcome::Fail => counter!(KbMetrics::GET_FAIL).increment(1),
    }
}

/// Record KB operation latency; `op` is `store` or `get`
pub fn record_kb_latency(op: &'static str, elapsed: Duration) {
    histogram!(KbMetrics::OP_SECONDS, "op" => op).record(elapsed.as_secs_f64());
}

/// Record a frame being sent
pub fn record_message_sent(performative: &str, protocol: &str) {
    counter!(
        MessageMetrics::SENT_TOTAL,
        "performative" => performative.to_string(),
        "protocol" => protocol.to_string()
    )
    .increment(1);
}

/// Record a frame being received
pub fn record_message_received(performative: &str) {
    counter!(
        MessageMetrics::RECEIVED_TOTAL,
        "performative" => performative.to_string()
    )
    .increment(1);
}

/// Record a conversation reaching its final reply
pub fn record_conversation_served(outcome: &str) {
    counter!(
        CoordinatorMetrics::CONVERSATIONS_TOTAL,
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_default() {
        let config = MetricsConfig::default();
        assert!(!config.kb_op_buckets.is_empty());
        assert_eq!(config.listen_addr.port(), 9108);
    }

    #[test]
    fn test_metric_names() {
        assert!(KbMetrics::STORE_OK.starts_with("kb_"));
        assert!(KbMetrics::OP_SECONDS.starts_with("kb_"));
        assert!(MessageMetrics::SENT_TOTAL.starts_with("mas_"));
    }
}
