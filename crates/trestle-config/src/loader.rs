//! Layered configuration loading.
//!
//! Later layers override earlier ones key by key:
//! 1. Defaults or a preset
//! 2. Configuration files (TOML or JSON), in the order they are added
//! 3. `PREFIX__SECTION__KEY` environment variables

use std::env;
use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::{ClientAuthMode, ConfigError, DispatchKind, LogFormat, TrestleConfig};

/// Configuration loader.
///
/// # Example
///
/// ```no_run
/// use trestle_config::ConfigLoader;
///
/// # fn main() -> Result<(), trestle_config::ConfigError> {
/// let config = ConfigLoader::new()
///     .with_production()
///     .with_optional_file("trestle.toml")?
///     .with_env_prefix("TRESTLE")
///     .load()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConfigLoader {
    config: TrestleConfig,
    env_prefix: Option<String>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Creates a loader starting from [`TrestleConfig::default`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: TrestleConfig::default(),
            env_prefix: None,
        }
    }

    /// Resets to the default values.
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        self.config = TrestleConfig::default();
        self
    }

    /// Resets to [`TrestleConfig::development`].
    #[must_use]
    pub fn with_development(mut self) -> Self {
        self.config = TrestleConfig::development();
        self
    }

    /// Resets to [`TrestleConfig::production`].
    #[must_use]
    pub fn with_production(mut self) -> Self {
        self.config = TrestleConfig::production();
        self
    }

    /// Layers a configuration file over the current values. The format
    /// follows the extension (`.toml` or `.json`). Keys the file leaves out
    /// keep their current value.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file is missing, unreadable, malformed,
    /// or contains unknown fields.
    pub fn with_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::file_not_found(path));
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::read_error(path, e))?;
        let format = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        self.with_string(&content, format)
    }

    /// Like [`with_file`](Self::with_file), but a missing file is skipped.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file exists but cannot be loaded.
    pub fn with_optional_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            self.with_file(path)
        } else {
            Ok(self)
        }
    }

    /// Layers configuration text in the given format (`"toml"` or `"json"`).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for an unknown format, a parse error or an
    /// unknown field.
    ///
    /// # Example
    ///
    /// ```
    /// use trestle_config::ConfigLoader;
    ///
    /// let config = ConfigLoader::new()
    ///     .with_string("[server]\nroot_path = \"/api\"", "toml")
    ///     .unwrap()
    ///     .load()
    ///     .unwrap();
    ///
    /// assert_eq!(config.server.root_path, "/api");
    /// assert_eq!(config.server.http_addr, "0.0.0.0:8080");
    /// ```
    pub fn with_string(mut self, content: &str, format: &str) -> Result<Self, ConfigError> {
        let layer: Value = match format.to_ascii_lowercase().as_str() {
            "toml" => {
                // Parsing into the schema first reports unknown fields with
                // TOML positions.
                toml::from_str::<TrestleConfig>(content)?;
                serde_json::to_value(toml::from_str::<toml::Table>(content)?)?
            }
            "json" => {
                serde_json::from_str::<TrestleConfig>(content)?;
                serde_json::from_str(content)?
            }
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        let mut merged = serde_json::to_value(&self.config)?;
        merge(&mut merged, layer);
        self.config = serde_json::from_value(merged)?;
        Ok(self)
    }

    /// Applies `PREFIX__SECTION__KEY` environment variables when loading.
    /// With prefix `"TRESTLE"`:
    /// - `TRESTLE__SERVER__HTTP_ADDR=0.0.0.0:9000`
    /// - `TRESTLE__SERVER__IDLE_TIMEOUT_MS=none`
    /// - `TRESTLE__TELEMETRY__LOGGING__LEVEL=debug`
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_uppercase());
        self
    }

    /// Loads a `.env` file from the current directory or its parents, if
    /// there is one.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Dotenv` if a `.env` file exists but is malformed.
    pub fn with_dotenv(self) -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(_) => Ok(self),
            Err(e) if e.not_found() => Ok(self),
            Err(e) => Err(e.into()),
        }
    }

    /// Applies environment overrides and validates.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if an environment variable cannot be parsed or
    /// validation fails.
    pub fn load(mut self) -> Result<TrestleConfig, ConfigError> {
        if let Some(prefix) = self.env_prefix.take() {
            let vars: Vec<(String, String)> = env::vars()
                .filter(|(key, _)| key.starts_with(&prefix))
                .collect();
            for (key, value) in vars {
                self.apply_env_var(&key, &value, &prefix)?;
            }
        }

        self.config.validate()?;
        Ok(self.config)
    }

    /// Returns the configuration without environment overrides or
    /// validation.
    #[must_use]
    pub fn load_unvalidated(self) -> TrestleConfig {
        self.config
    }

    fn apply_env_var(&mut self, key: &str, value: &str, prefix: &str) -> Result<(), ConfigError> {
        // `TRESTLE_FOO` shares the prefix but is not ours.
        let Some(path) = key.strip_prefix(prefix).and_then(|k| k.strip_prefix("__")) else {
            return Ok(());
        };
        let parts: Vec<&str> = path.split("__").collect();
        let server = &mut self.config.server;
        let telemetry = &mut self.config.telemetry;

        match parts.as_slice() {
            ["SERVER", "HTTP_ADDR"] => server.http_addr = value.to_string(),
            ["SERVER", "SHUTDOWN_TIMEOUT_SECS"] => {
                server.shutdown_timeout_secs = parse_number(key, value)?;
            }
            ["SERVER", "IDLE_TIMEOUT_MS"] => {
                server.idle_timeout_ms = if value.is_empty() || value.eq_ignore_ascii_case("none") {
                    None
                } else {
                    Some(parse_number(key, value)?)
                };
            }
            ["SERVER", "ROOT_PATH"] => server.root_path = value.to_string(),
            ["SERVER", "CLIENT_AUTH"] => {
                server.client_auth = match value.to_ascii_lowercase().as_str() {
                    "none" => ClientAuthMode::None,
                    "optional" => ClientAuthMode::Optional,
                    "require" | "required" => ClientAuthMode::Require,
                    _ => {
                        return Err(ConfigError::env_parse_error(
                            key,
                            "expected 'none', 'optional' or 'require'",
                        ))
                    }
                };
            }
            ["SERVER", "DISPATCH_MODE"] => {
                server.dispatch_mode = match value.to_ascii_lowercase().as_str() {
                    "inline" => DispatchKind::Inline,
                    "offload" => DispatchKind::Offload,
                    _ => return Err(ConfigError::env_parse_error(key, "expected 'inline' or 'offload'")),
                };
            }
            ["SERVER", "MAX_OFFLOAD_WORKERS"] => {
                server.max_offload_workers = parse_number(key, value)?;
            }

            ["TELEMETRY", "SERVICE_NAME"] => telemetry.service_name = value.to_string(),
            ["TELEMETRY", "SERVICE_VERSION"] => {
                telemetry.service_version = Some(value.to_string()).filter(|v| !v.is_empty());
            }
            ["TELEMETRY", "ENVIRONMENT"] => telemetry.environment = value.to_string(),

            ["TELEMETRY", "METRICS", "ENABLED"] => {
                telemetry.metrics.enabled = parse_flag(key, value)?;
            }
            ["TELEMETRY", "METRICS", "ADDR"] => {
                telemetry.metrics.addr = Some(value.to_string()).filter(|v| !v.is_empty());
            }

            ["TELEMETRY", "LOGGING", "ENABLED"] => {
                telemetry.logging.enabled = parse_flag(key, value)?;
            }
            ["TELEMETRY", "LOGGING", "LEVEL"] => telemetry.logging.level = value.to_string(),
            ["TELEMETRY", "LOGGING", "FORMAT"] => {
                telemetry.logging.format = match value.to_ascii_lowercase().as_str() {
                    "json" => LogFormat::Json,
                    "pretty" => LogFormat::Pretty,
                    _ => return Err(ConfigError::env_parse_error(key, "expected 'json' or 'pretty'")),
                };
            }
            ["TELEMETRY", "LOGGING", "SPAN_EVENTS"] => {
                telemetry.logging.span_events = parse_flag(key, value)?;
            }
            ["TELEMETRY", "LOGGING", "INCLUDE_LOCATION"] => {
                telemetry.logging.include_location = parse_flag(key, value)?;
            }
            ["TELEMETRY", "LOGGING", "THREAD_IDS"] => {
                telemetry.logging.thread_ids = parse_flag(key, value)?;
            }

            _ => {}
        }

        Ok(())
    }
}

/// Recursively overlays `layer` onto `base`. Objects merge key by key;
/// everything else replaces.
fn merge(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base), Value::Object(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::env_parse_error(key, "expected a non-negative integer"))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::env_parse_error(key, "expected boolean")),
    }
}
