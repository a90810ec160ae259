// observability/mod.rs - Metrics and Tracing
//
//! Observability for the control plane:
//! - Prometheus metrics (KB counters, `kb_op_seconds`, bus traffic) exposed
//!   over an HTTP endpoint
//! - Structured tracing with configurable formats

pub mod metrics;
pub mod tracing_setup;

pub use metrics::{
    CoordinatorMetrics, KbGetOutcome, KbMetrics, KbStoreOutcome, MessageMetrics, MetricsConfig,
    MetricsHandle, init_metrics, record_conversation_served, record_kb_get, record_kb_latency,
    record_kb_store, record_message_received, record_message_sent,
};
pub use tracing_setup::{TracingConfig, TracingFormat, init_tracing};
