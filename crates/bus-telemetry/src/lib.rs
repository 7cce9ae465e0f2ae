//! # Bus Telemetry
//!
//! Observability for RapidBus hosts and the bus itself.
//!
//! ## Components
//!
//! - **Logging**: `tracing-subscriber` registry with an env filter and a
//!   pretty or JSON formatter
//! - **Metrics**: Prometheus counters, gauges and histograms for the publish
//!   and consume paths
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bus_telemetry::{init_telemetry, TelemetryConfig};
//!
//! fn main() {
//!     let _guard = init_telemetry(TelemetryConfig::from_env()).expect("telemetry");
//!     // Bus code here logs through `tracing` and updates the metrics below
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RAPID_BUS_SERVICE_NAME` | `rapid-bus` | Service name attached to logs |
//! | `RAPID_BUS_LOG_LEVEL` | `info` | Log level filter (falls back to `RUST_LOG`) |
//! | `RAPID_BUS_JSON_LOGS` | `false` | Emit JSON formatted logs |
//! | `RAPID_BUS_CONSOLE_OUTPUT` | `true` | Write logs to stdout |

mod config;
mod logging;
mod metrics;

pub use config::TelemetryConfig;
pub use logging::{init_logging, LoggingHandle};
pub use metrics::{
    gather, register_metrics, MetricsHandle, CONNECTION_RECOVERIES, DELIVERIES_ACKED,
    DELIVERIES_DROPPED, DELIVERIES_RECEIVED, DELIVERIES_REQUEUED, EVENTS_PUBLISHED,
    HANDLERS_IN_FLIGHT, HANDLER_DURATION, HANDLER_EXECUTIONS, PUBLISH_FAILURES, PUBLISH_RETRIES,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and metrics.
///
/// Returns a guard that should be held for the lifetime of the host.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let metrics = register_metrics()?;
    let logging = init_logging(&config)?;

    tracing::info!(
        service = %config.service_name,
        log_level = %config.log_level,
        json_logs = config.json_logs,
        "Telemetry initialized"
    );

    Ok(TelemetryGuard {
        _logging: logging,
        _metrics: metrics,
    })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    _logging: LoggingHandle,
    _metrics: MetricsHandle,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry");
    }
}
