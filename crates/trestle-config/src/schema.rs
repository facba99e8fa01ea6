//! Configuration schema types.
//!
//! Every section rejects unknown fields and fills missing ones with defaults.

use serde::{Deserialize, Serialize};

/// Client certificate policy for TLS listeners.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuthMode {
    /// Never ask for a client certificate.
    None,
    /// Accept clients with or without a certificate.
    Optional,
    /// Refuse clients that present no certificate.
    #[default]
    #[serde(alias = "required")]
    Require,
}

/// Where the dispatcher runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DispatchKind {
    /// On the connection's I/O task.
    #[default]
    Inline,
    /// On the blocking pool, bounded by `max_offload_workers`.
    Offload,
}

/// Server configuration section.
///
/// # Example
///
/// ```
/// use trestle_config::{ClientAuthMode, ServerSection};
///
/// let section: ServerSection = toml::from_str(r#"
///     http_addr = "127.0.0.1:3000"
///     idle_timeout_ms = 60000
///     client_auth = "optional"
/// "#).unwrap();
///
/// assert_eq!(section.idle_timeout_ms, Some(60_000));
/// assert_eq!(section.client_auth, ClientAuthMode::Optional);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// Bind address (e.g., "0.0.0.0:8080"). Port `0` picks a free port.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// How long shutdown waits for open connections, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Idle connection timeout in milliseconds. Absent disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,

    /// Root resource path the application is mounted under.
    #[serde(default = "default_root_path")]
    pub root_path: String,

    /// Client certificate policy, applied when TLS is configured.
    #[serde(default)]
    pub client_auth: ClientAuthMode,

    /// Where the dispatcher runs.
    #[serde(default)]
    pub dispatch_mode: DispatchKind,

    /// Concurrent dispatch limit for `dispatch_mode = "offload"`.
    #[serde(default = "default_max_offload_workers")]
    pub max_offload_workers: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            idle_timeout_ms: None,
            root_path: default_root_path(),
            client_auth: ClientAuthMode::default(),
            dispatch_mode: DispatchKind::default(),
            max_offload_workers: default_max_offload_workers(),
        }
    }
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_root_path() -> String {
    "/".to_string()
}

fn default_max_offload_workers() -> usize {
    64
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MetricsSection {
    /// Install the Prometheus recorder.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Scrape endpoint address. Absent installs the recorder only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,

    /// Request duration buckets, in seconds.
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: None,
            duration_buckets: default_duration_buckets(),
        }
    }
}

fn default_duration_buckets() -> Vec<f64> {
    trestle_telemetry::MetricsConfig::default().duration_buckets
}

/// Log format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON lines (production).
    #[default]
    Json,
    /// Human-readable output (development).
    Pretty,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    /// Install the tracing subscriber.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Filter directive, e.g. `"info"` or `"trestle_server=debug"`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Log span open and close events.
    #[serde(default)]
    pub span_events: bool,

    /// Include source file and line.
    #[serde(default)]
    pub include_location: bool,

    /// Include thread IDs.
    #[serde(default)]
    pub thread_ids: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
            format: LogFormat::default(),
            span_events: false,
            include_location: false,
            thread_ids: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Telemetry configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySection {
    /// Service name attached to telemetry.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Service version. Absent uses the crate version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_version: Option<String>,

    /// Deployment environment.
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsSection,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            service_version: None,
            environment: default_environment(),
            metrics: MetricsSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

fn default_service_name() -> String {
    "trestle".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_section_default() {
        let section = ServerSection::default();
        assert_eq!(section.http_addr, "0.0.0.0:8080");
        assert_eq!(section.shutdown_timeout_secs, 30);
        assert_eq!(section.idle_timeout_ms, None);
        assert_eq!(section.root_path, "/");
        assert_eq!(section.client_auth, ClientAuthMode::Require);
        assert_eq!(section.dispatch_mode, DispatchKind::Inline);
    }

    #[test]
    fn test_server_section_partial_deserialize() {
        let toml = r#"
            http_addr = "127.0.0.1:3000"
            dispatch_mode = "offload"
            max_offload_workers = 8
        "#;
        let section: ServerSection = toml::from_str(toml).unwrap();
        assert_eq!(section.http_addr, "127.0.0.1:3000");
        assert_eq!(section.dispatch_mode, DispatchKind::Offload);
        assert_eq!(section.max_offload_workers, 8);
        assert_eq!(section.shutdown_timeout_secs, 30);
    }

    #[test]
    fn test_server_section_unknown_field_rejected() {
        let toml = r#"
            http_addr = "127.0.0.1:3000"
            http2_enabled = true
        "#;
        let result: Result<ServerSection, _> = toml::from_str(toml);
        assert!(result.is_err());
    }

    #[test]
    fn test_client_auth_mode_names() {
        let parse = |s: &str| serde_json::from_str::<ClientAuthMode>(s).unwrap();
        assert_eq!(parse(r#""none""#), ClientAuthMode::None);
        assert_eq!(parse(r#""optional""#), ClientAuthMode::Optional);
        assert_eq!(parse(r#""require""#), ClientAuthMode::Require);
        assert_eq!(parse(r#""required""#), ClientAuthMode::Require);
        assert!(serde_json::from_str::<ClientAuthMode>(r#""sometimes""#).is_err());
    }

    #[test]
    fn test_metrics_section_default_matches_recorder() {
        let section = MetricsSection::default();
        assert!(section.enabled);
        assert!(section.addr.is_none());
        assert_eq!(
            section.duration_buckets,
            trestle_telemetry::MetricsConfig::default().duration_buckets
        );
    }

    #[test]
    fn test_log_format_deserialize() {
        assert_eq!(serde_json::from_str::<LogFormat>(r#""json""#).unwrap(), LogFormat::Json);
        assert_eq!(serde_json::from_str::<LogFormat>(r#""pretty""#).unwrap(), LogFormat::Pretty);
    }

    #[test]
    fn test_telemetry_section_default() {
        let section = TelemetrySection::default();
        assert_eq!(section.service_name, "trestle");
        assert_eq!(section.environment, "development");
        assert_eq!(section.logging.level, "info");
    }
}
