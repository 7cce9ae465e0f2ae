//! Prometheus metrics for the event bus.
//!
//! All metrics follow the naming convention: `rapid_bus_<area>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., events_published_total)
//! - **Gauge**: Value that can go up or down (e.g., handlers_in_flight)
//! - **Histogram**: Distribution of values (e.g., handler_duration_seconds)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Registry holding every bus metric
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // PUBLISH PATH
    // =========================================================================

    /// Events accepted by the broker
    pub static ref EVENTS_PUBLISHED: CounterVec = CounterVec::new(
        Opts::new("rapid_bus_publish_events_total", "Events accepted by the broker"),
        &["event_name"]
    ).expect("metric creation failed");

    /// Publish attempts that failed transiently and were retried
    pub static ref PUBLISH_RETRIES: Counter = Counter::new(
        "rapid_bus_publish_retries_total",
        "Publish attempts retried after a transient broker failure"
    ).expect("metric creation failed");

    /// Publishes that surfaced an error to the caller
    pub static ref PUBLISH_FAILURES: Counter = Counter::new(
        "rapid_bus_publish_failures_total",
        "Publishes that failed after exhausting retries or on a permanent error"
    ).expect("metric creation failed");

    // =========================================================================
    // CONSUME PATH
    // =========================================================================

    /// Deliveries received from the broker
    pub static ref DELIVERIES_RECEIVED: Counter = Counter::new(
        "rapid_bus_consume_deliveries_received_total",
        "Deliveries received from the broker"
    ).expect("metric creation failed");

    /// Deliveries positively acknowledged after successful dispatch
    pub static ref DELIVERIES_ACKED: Counter = Counter::new(
        "rapid_bus_consume_deliveries_acked_total",
        "Deliveries acknowledged after successful dispatch"
    ).expect("metric creation failed");

    /// Deliveries negatively acknowledged with requeue
    pub static ref DELIVERIES_REQUEUED: Counter = Counter::new(
        "rapid_bus_consume_deliveries_requeued_total",
        "Deliveries returned to the queue after a dispatch failure"
    ).expect("metric creation failed");

    /// Deliveries acknowledged without dispatch (no subscription, undecodable)
    pub static ref DELIVERIES_DROPPED: CounterVec = CounterVec::new(
        Opts::new("rapid_bus_consume_deliveries_dropped_total", "Deliveries dropped without dispatch"),
        &["reason"]  // reason: unsubscribed/undecodable
    ).expect("metric creation failed");

    // =========================================================================
    // DISPATCH
    // =========================================================================

    /// Handler executions by outcome
    pub static ref HANDLER_EXECUTIONS: CounterVec = CounterVec::new(
        Opts::new("rapid_bus_dispatch_handler_executions_total", "Handler executions"),
        &["outcome"]  // outcome: success/failure/panic
    ).expect("metric creation failed");

    /// Handler executions currently holding an admission slot
    pub static ref HANDLERS_IN_FLIGHT: Gauge = Gauge::new(
        "rapid_bus_dispatch_handlers_in_flight",
        "Handler executions currently running"
    ).expect("metric creation failed");

    /// Time spent running the pipeline for one subscription
    pub static ref HANDLER_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "rapid_bus_dispatch_handler_duration_seconds",
            "Time spent running the pipeline and handler for one subscription"
        ).buckets(exponential_buckets(0.0005, 2.0, 16).expect("valid buckets"))
    ).expect("metric creation failed");

    // =========================================================================
    // CONNECTION
    // =========================================================================

    /// Successful reconnects following a connection failure
    pub static ref CONNECTION_RECOVERIES: Counter = Counter::new(
        "rapid_bus_connection_recoveries_total",
        "Reconnects that followed a connection failure"
    ).expect("metric creation failed");
}

/// Handle to the registered metrics
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

/// Register all bus metrics with the global registry.
///
/// Calling this more than once is harmless.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Publish
        Box::new(EVENTS_PUBLISHED.clone()),
        Box::new(PUBLISH_RETRIES.clone()),
        Box::new(PUBLISH_FAILURES.clone()),
        // Consume
        Box::new(DELIVERIES_RECEIVED.clone()),
        Box::new(DELIVERIES_ACKED.clone()),
        Box::new(DELIVERIES_REQUEUED.clone()),
        Box::new(DELIVERIES_DROPPED.clone()),
        // Dispatch
        Box::new(HANDLER_EXECUTIONS.clone()),
        Box::new(HANDLERS_IN_FLIGHT.clone()),
        Box::new(HANDLER_DURATION.clone()),
        // Connection
        Box::new(CONNECTION_RECOVERIES.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

/// Encode all metrics as Prometheus text format.
pub fn gather() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
