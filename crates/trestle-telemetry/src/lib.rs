//! Logging and metrics for Trestle.
//!
//! - **Logging**: `tracing-subscriber` with JSON or pretty output
//! - **Metrics**: Prometheus-format metrics via the `metrics` facade
//!
//! The bridge and server crates record through [`metrics`] functions such as
//! [`metrics::record_request`]; nothing is exported until [`init_telemetry`]
//! (or [`init_metrics`]) installs a recorder.
//!
//! # Example
//!
//! ```rust,ignore
//! use trestle_telemetry::{init_telemetry, TelemetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TelemetryConfig::builder()
//!         .service_name("orders")
//!         .metrics_addr("0.0.0.0:9090")
//!         .build();
//!     let telemetry = init_telemetry(config).expect("telemetry");
//!     // ...
//!     println!("{}", telemetry.render_metrics().unwrap_or_default());
//! }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

pub use config::{TelemetryConfig, TelemetryConfigBuilder};
pub use error::TelemetryError;
pub use logging::{init_logging, LogConfig};
pub use metrics::{init_metrics, render_metrics, ConnectionGuard, InFlightGuard, MetricsConfig, MetricsRegistry};

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Handle returned by [`init_telemetry`].
#[derive(Debug, Clone, Default)]
pub struct TelemetryGuard {
    metrics: Option<MetricsRegistry>,
}

impl TelemetryGuard {
    /// Renders the installed metrics, if metrics are enabled.
    #[must_use]
    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(MetricsRegistry::render)
    }
}

/// Initializes logging, then metrics.
///
/// # Errors
///
/// Returns `TelemetryError` if either subsystem fails to initialize.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryResult<TelemetryGuard> {
    init_logging(&config.logging)?;
    let metrics = init_metrics(&config.metrics)?;

    tracing::info!(
        service.name = %config.service_name,
        service.version = %config.service_version,
        environment = %config.environment,
        "telemetry initialized"
    );
    Ok(TelemetryGuard { metrics })
}
