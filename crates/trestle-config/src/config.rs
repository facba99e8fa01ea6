//! Top-level [`TrestleConfig`] and its builder.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use trestle_telemetry::{LogConfig, MetricsConfig, TelemetryConfig};

use crate::{ConfigError, DispatchKind, LogFormat, ServerSection, TelemetrySection};

/// Complete Trestle configuration.
///
/// Use [`ConfigLoader`](crate::ConfigLoader) to layer files and environment
/// variables over the defaults.
///
/// # Example
///
/// ```
/// use trestle_config::TrestleConfig;
///
/// let config = TrestleConfig::default();
/// assert_eq!(config.server.http_addr, "0.0.0.0:8080");
/// assert!(config.idle_timeout().is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct TrestleConfig {
    /// Listener and bridge settings.
    #[serde(default)]
    pub server: ServerSection,

    /// Logging and metrics.
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

impl TrestleConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder() -> TrestleConfigBuilder {
        TrestleConfigBuilder::new()
    }

    /// Checks values that deserialize fine but cannot be served.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;

        if server.http_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::invalid_value(
                "server.http_addr",
                format!("invalid socket address: {}", server.http_addr),
            ));
        }

        if server.idle_timeout_ms == Some(0) {
            return Err(ConfigError::invalid_value(
                "server.idle_timeout_ms",
                "must be greater than zero; omit it to disable the idle timeout",
            ));
        }

        if server.root_path.contains(['?', '#']) {
            return Err(ConfigError::invalid_value(
                "server.root_path",
                "must not contain a query or fragment",
            ));
        }

        if server.dispatch_mode == DispatchKind::Offload && server.max_offload_workers == 0 {
            return Err(ConfigError::invalid_value(
                "server.max_offload_workers",
                "must be at least 1 when dispatch_mode is \"offload\"",
            ));
        }

        let metrics = &self.telemetry.metrics;
        if let Some(addr) = metrics.addr.as_deref().filter(|_| metrics.enabled) {
            if addr.parse::<SocketAddr>().is_err() {
                return Err(ConfigError::invalid_value(
                    "telemetry.metrics.addr",
                    format!("invalid socket address: {addr}"),
                ));
            }
        }

        let logging = &self.telemetry.logging;
        if logging.enabled {
            if let Err(e) = trestle_telemetry::logging::create_env_filter(&logging.level) {
                return Err(ConfigError::invalid_value("telemetry.logging.level", e.to_string()));
            }
        }

        Ok(())
    }

    /// Graceful shutdown timeout.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Idle connection timeout, if enabled.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.server.idle_timeout_ms.map(Duration::from_millis)
    }

    /// Converts the telemetry section into the form `init_telemetry` takes.
    #[must_use]
    pub fn telemetry_config(&self) -> TelemetryConfig {
        let section = &self.telemetry;
        let mut builder = TelemetryConfig::builder()
            .service_name(section.service_name.clone())
            .environment(section.environment.clone())
            .metrics(MetricsConfig {
                enabled: section.metrics.enabled,
                listen_addr: section.metrics.addr.clone(),
                duration_buckets: section.metrics.duration_buckets.clone(),
            })
            .logging(LogConfig {
                enabled: section.logging.enabled,
                level: section.logging.level.clone(),
                json_format: section.logging.format == LogFormat::Json,
                span_events: section.logging.span_events,
                file_line_info: section.logging.include_location,
                thread_ids: section.logging.thread_ids,
            });
        if let Some(version) = &section.service_version {
            builder = builder.service_version(version.clone());
        }
        builder.build()
    }

    /// Local development preset: pretty debug logs, no client certificates,
    /// a one minute idle timeout.
    ///
    /// # Example
    ///
    /// ```
    /// use trestle_config::TrestleConfig;
    ///
    /// let config = TrestleConfig::development();
    /// assert_eq!(config.telemetry.logging.level, "debug");
    /// ```
    #[must_use]
    pub fn development() -> Self {
        let mut config = Self::default();

        config.server.client_auth = crate::ClientAuthMode::None;
        config.server.idle_timeout_ms = Some(60_000);

        let logging = &mut config.telemetry.logging;
        logging.level = "debug".to_string();
        logging.format = LogFormat::Pretty;
        logging.span_events = true;
        logging.include_location = true;
        logging.thread_ids = true;

        config.telemetry.environment = "development".to_string();
        config
    }

    /// Production preset: JSON logs, required client certificates, offloaded
    /// dispatch and a scrape endpoint on port 9090.
    ///
    /// # Example
    ///
    /// ```
    /// use trestle_config::{LogFormat, TrestleConfig};
    ///
    /// let config = TrestleConfig::production();
    /// assert_eq!(config.telemetry.logging.format, LogFormat::Json);
    /// ```
    #[must_use]
    pub fn production() -> Self {
        let mut config = Self::default();

        config.server.client_auth = crate::ClientAuthMode::Require;
        config.server.idle_timeout_ms = Some(120_000);
        config.server.dispatch_mode = DispatchKind::Offload;

        let logging = &mut config.telemetry.logging;
        logging.level = "info".to_string();
        logging.format = LogFormat::Json;
        logging.span_events = false;
        logging.include_location = false;

        config.telemetry.environment = "production".to_string();
        config.telemetry.metrics.addr = Some("0.0.0.0:9090".to_string());
        config
    }
}

/// Builder for [`TrestleConfig`].
#[derive(Debug, Default)]
pub struct TrestleConfigBuilder {
    server: Option<ServerSection>,
    telemetry: Option<TelemetrySection>,
}

impl TrestleConfigBuilder {
    /// Creates a builder; unset sections use their defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the server section.
    #[must_use]
    pub fn server(mut self, server: ServerSection) -> Self {
        self.server = Some(server);
        self
    }

    /// Sets the telemetry section.
    #[must_use]
    pub fn telemetry(mut self, telemetry: TelemetrySection) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> TrestleConfig {
        TrestleConfig {
            server: self.server.unwrap_or_default(),
            telemetry: self.telemetry.unwrap_or_default(),
        }
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if validation fails.
    pub fn build_validated(self) -> Result<TrestleConfig, ConfigError> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}
