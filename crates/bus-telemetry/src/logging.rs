//! Structured logging setup.
//!
//! Installs a global `tracing` subscriber. In JSON mode every line carries
//! the target, thread id, file and line so log shippers can index them; in
//! pretty mode output is tuned for local development.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{TelemetryConfig, TelemetryError};

/// Handle returned once the global subscriber is installed.
pub struct LoggingHandle {
    _initialized: bool,
}

/// Initialize the global `tracing` subscriber from configuration.
///
/// `RUST_LOG` takes precedence over `config.log_level` when set.
///
/// # Errors
///
/// Returns `TelemetryError::Config` for an invalid filter directive and
/// `TelemetryError::LoggingInit` when a global subscriber is already set.
pub fn init_logging(config: &TelemetryConfig) -> Result<LoggingHandle, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| TelemetryError::Config(e.to_string()))?;

    if !config.console_output {
        tracing_subscriber::registry()
            .with(env_filter)
            .try_init()
            .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
    } else if config.json_logs {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .try_init()
            .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
    }

    tracing::debug!(
        service = %config.service_name,
        json_logs = config.json_logs,
        "Structured logging configured"
    );

    Ok(LoggingHandle { _initialized: true })
}

/// Log a bus event with the standard `event_name` field.
#[macro_export]
macro_rules! log_bus_event {
    ($level:ident, $event_name:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            event_name = %$event_name,
            $($($field)*,)?
            $msg
        )
    };
}
