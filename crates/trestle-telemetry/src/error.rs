//! Telemetry error types.

use thiserror::Error;

/// Errors that can occur while setting up telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to install the metrics recorder or exporter.
    #[error("Failed to initialize metrics: {0}")]
    MetricsInit(String),

    /// Failed to install the tracing subscriber.
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    /// The metrics listen address could not be parsed.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The Prometheus HTTP listener needs a running Tokio runtime.
    #[error("metrics exporter must be started inside a Tokio runtime")]
    NoRuntime,
}
