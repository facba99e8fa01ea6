//! Prometheus metrics for Trestle.
//!
//! # Standard Metrics
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `trestle_requests_total` | Counter | `status` | Finished requests by final status |
//! | `trestle_request_duration_seconds` | Histogram | - | Time until the exchange finishes |
//! | `trestle_in_flight_requests` | Gauge | - | Exchanges currently running |
//! | `trestle_suspended_requests_total` | Counter | - | Requests suspended by the dispatcher |
//! | `trestle_completion_timeouts_total` | Counter | - | Declared completion timeouts that fired |
//! | `trestle_bodies_released_total` | Counter | `reason` | Request bodies released |
//! | `trestle_request_size_bytes` | Histogram | - | Buffered request body size |
//! | `trestle_idle_closed_total` | Counter | - | Connections closed for inactivity |
//! | `trestle_connections_open` | Gauge | - | Open transport connections |
//!
//! Recording functions work without [`init_metrics`]; the `metrics` facade
//! drops samples when no recorder is installed.

use crate::error::TelemetryError;
use crate::TelemetryResult;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

/// Request counter name.
pub const REQUESTS_TOTAL: &str = "trestle_requests_total";
/// Request duration histogram name.
pub const REQUEST_DURATION_SECONDS: &str = "trestle_request_duration_seconds";
/// In-flight gauge name.
pub const IN_FLIGHT_REQUESTS: &str = "trestle_in_flight_requests";
/// Suspended request counter name.
pub const SUSPENDED_REQUESTS_TOTAL: &str = "trestle_suspended_requests_total";
/// Completion timeout counter name.
pub const COMPLETION_TIMEOUTS_TOTAL: &str = "trestle_completion_timeouts_total";
/// Body release counter name.
pub const BODIES_RELEASED_TOTAL: &str = "trestle_bodies_released_total";
/// Request size histogram name.
pub const REQUEST_SIZE_BYTES: &str = "trestle_request_size_bytes";
/// Idle close counter name.
pub const IDLE_CLOSED_TOTAL: &str = "trestle_idle_closed_total";
/// Open connection gauge name.
pub const CONNECTIONS_OPEN: &str = "trestle_connections_open";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Whether metrics are enabled.
    pub enabled: bool,

    /// Address for the Prometheus scrape endpoint. `None` installs the
    /// recorder only; use [`render_metrics`] to expose it yourself.
    pub listen_addr: Option<String>,

    /// Histogram buckets for request duration, in seconds.
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: None,
            duration_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ],
        }
    }
}

/// Handle for rendering the installed recorder.
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    handle: PrometheusHandle,
}

impl MetricsRegistry {
    /// Renders all metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Installs the global Prometheus recorder.
///
/// With a `listen_addr` the scrape endpoint is spawned on the current Tokio
/// runtime. Returns `Ok(None)` when metrics are disabled.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<Option<MetricsRegistry>> {
    if !config.enabled {
        return Ok(None);
    }

    let mut builder = PrometheusBuilder::new();
    if !config.duration_buckets.is_empty() {
        builder = builder
            .set_buckets_for_metric(
                Matcher::Full(REQUEST_DURATION_SECONDS.to_string()),
                &config.duration_buckets,
            )
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    }

    let recorder = match &config.listen_addr {
        Some(addr) => {
            let addr: SocketAddr = addr
                .parse()
                .map_err(|e| TelemetryError::InvalidAddress(format!("{addr}: {e}")))?;
            let runtime = tokio::runtime::Handle::try_current().map_err(|_| TelemetryError::NoRuntime)?;
            let _entered = runtime.enter();
            let (recorder, exporter) = builder
                .with_http_listener(addr)
                .build()
                .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
            runtime.spawn(async move {
                if let Err(e) = exporter.await {
                    tracing::error!(error = ?e, "metrics exporter stopped");
                }
            });
            tracing::info!(%addr, "metrics endpoint listening");
            recorder
        }
        None => builder.build_recorder(),
    };

    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    let _ = METRICS_HANDLE.set(handle.clone());

    describe_metrics();
    Ok(Some(MetricsRegistry { handle }))
}

/// Renders metrics in Prometheus format, or `None` before [`init_metrics`].
#[must_use]
pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

fn describe_metrics() {
    describe_counter!(REQUESTS_TOTAL, "Finished requests by final response status");
    describe_histogram!(
        REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Time from request arrival until the exchange finishes"
    );
    describe_gauge!(IN_FLIGHT_REQUESTS, "Request exchanges currently running");
    describe_counter!(SUSPENDED_REQUESTS_TOTAL, "Requests suspended for asynchronous completion");
    describe_counter!(COMPLETION_TIMEOUTS_TOTAL, "Declared completion timeouts that expired");
    describe_counter!(BODIES_RELEASED_TOTAL, "Buffered request bodies released, by reason");
    describe_histogram!(REQUEST_SIZE_BYTES, Unit::Bytes, "Buffered request body size");
    describe_counter!(IDLE_CLOSED_TOTAL, "Connections closed after the idle timeout");
    describe_gauge!(CONNECTIONS_OPEN, "Open transport connections");
}

/// Records a finished request that ended with `status_code`.
pub fn record_request(status_code: u16, duration: Duration) {
    counter!(REQUESTS_TOTAL, "status" => status_code.to_string()).increment(1);
    histogram!(REQUEST_DURATION_SECONDS).record(duration.as_secs_f64());
}

/// Records the size of a buffered request body.
pub fn record_request_size(size_bytes: usize) {
    histogram!(REQUEST_SIZE_BYTES).record(size_bytes as f64);
}

/// Records a request suspended by the dispatcher.
pub fn record_suspended() {
    counter!(SUSPENDED_REQUESTS_TOTAL).increment(1);
}

/// Records a declared completion timeout that expired.
pub fn record_completion_timeout() {
    counter!(COMPLETION_TIMEOUTS_TOTAL).increment(1);
}

/// Records a body release; `reason` is `"completed"` or `"discarded"`.
pub fn record_body_released(reason: &'static str) {
    counter!(BODIES_RELEASED_TOTAL, "reason" => reason).increment(1);
}

/// Records a connection closed for inactivity.
pub fn record_idle_close() {
    counter!(IDLE_CLOSED_TOTAL).increment(1);
}

/// Keeps `trestle_in_flight_requests` raised while alive.
#[derive(Debug)]
pub struct InFlightGuard {
    _private: (),
}

impl InFlightGuard {
    /// Increments the gauge; dropping the guard decrements it.
    #[must_use]
    pub fn new() -> Self {
        gauge!(IN_FLIGHT_REQUESTS).increment(1.0);
        Self { _private: () }
    }
}

impl Default for InFlightGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        gauge!(IN_FLIGHT_REQUESTS).decrement(1.0);
    }
}

/// Keeps `trestle_connections_open` raised while alive.
#[derive(Debug)]
pub struct ConnectionGuard {
    _private: (),
}

impl ConnectionGuard {
    /// Increments the gauge; dropping the guard decrements it.
    #[must_use]
    pub fn new() -> Self {
        gauge!(CONNECTIONS_OPEN).increment(1.0);
        Self { _private: () }
    }
}

impl Default for ConnectionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        gauge!(CONNECTIONS_OPEN).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn test_default_config() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert!(config.listen_addr.is_none());
        assert!(!config.duration_buckets.is_empty());
    }

    #[test]
    fn test_disabled_metrics_install_nothing() {
        let config = MetricsConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(init_metrics(&config).unwrap().is_none());
    }

    #[test]
    fn test_invalid_listen_addr() {
        let config = MetricsConfig {
            listen_addr: Some("not-an-addr".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            init_metrics(&config),
            Err(TelemetryError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_recorded_metrics_render() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            record_request(503, Duration::from_millis(5));
            record_body_released("discarded");
            record_idle_close();
            let _in_flight = InFlightGuard::new();
        });

        let rendered = handle.render();
        assert!(rendered.contains("trestle_requests_total{status=\"503\"} 1"));
        assert!(rendered.contains("trestle_bodies_released_total{reason=\"discarded\"} 1"));
        assert!(rendered.contains("trestle_idle_closed_total 1"));
        assert!(rendered.contains("trestle_in_flight_requests 0"));
    }

    #[test]
    fn test_record_functions_without_recorder() {
        record_request(200, Duration::from_millis(10));
        record_request_size(1024);
        record_suspended();
        record_completion_timeout();
        let _connection = ConnectionGuard::new();
    }
}
