//! # Trestle Config
//!
//! Typed configuration for Trestle servers.
//!
//! Values are layered: built-in defaults (or a preset), then TOML/JSON files,
//! then environment variables. Unknown fields are rejected, so a typo in a
//! file fails loudly instead of silently keeping a default.
//!
//! ## Example
//!
//! ```rust,no_run
//! use trestle_config::ConfigLoader;
//!
//! let config = ConfigLoader::new()
//!     .with_defaults()
//!     .with_file("trestle.toml")?
//!     .with_env_prefix("TRESTLE")
//!     .load()?;
//! # Ok::<(), trestle_config::ConfigError>(())
//! ```
//!
//! ## Configuration File Format (TOML)
//!
//! ```toml
//! [server]
//! http_addr = "0.0.0.0:8080"
//! shutdown_timeout_secs = 30
//! idle_timeout_ms = 60000
//! root_path = "/api"
//! client_auth = "require"
//! dispatch_mode = "offload"
//! max_offload_workers = 64
//!
//! [telemetry]
//! service_name = "orders"
//! environment = "production"
//!
//! [telemetry.metrics]
//! enabled = true
//! addr = "0.0.0.0:9090"
//!
//! [telemetry.logging]
//! level = "info"
//! format = "json"
//! ```
//!
//! ## Environment Variable Overrides
//!
//! Use `PREFIX__SECTION__KEY`, for example:
//!
//! - `TRESTLE__SERVER__HTTP_ADDR=0.0.0.0:9000`
//! - `TRESTLE__SERVER__CLIENT_AUTH=optional`
//! - `TRESTLE__TELEMETRY__METRICS__ENABLED=false`

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod config;
mod error;
mod loader;
mod schema;

pub use config::{TrestleConfig, TrestleConfigBuilder};
pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{
    ClientAuthMode, DispatchKind, LogFormat, LoggingSection, MetricsSection, ServerSection,
    TelemetrySection,
};
