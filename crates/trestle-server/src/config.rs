//! Server configuration types.
//!
//! # Example
//!
//! ```rust
//! use trestle_server::{DispatchMode, ServerConfig};
//! use std::time::Duration;
//!
//! let config = ServerConfig::builder()
//!     .http_addr("0.0.0.0:8080")
//!     .idle_timeout(Some(Duration::from_secs(60)))
//!     .root_path("api")
//!     .dispatch_mode(DispatchMode::Offload { max_concurrent: 64 })
//!     .build();
//!
//! assert_eq!(config.root_path(), "/api");
//! ```

use crate::tls::ClientAuth;
use std::net::SocketAddr;
use std::time::Duration;
use trestle_core::envelope::normalize_root_path;

/// Default HTTP bind address.
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Where the dispatcher runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// On the connection's I/O task. A slow dispatcher stalls that task.
    #[default]
    Inline,
    /// On Tokio's blocking pool, with at most `max_concurrent` calls at once.
    Offload {
        /// Concurrent dispatch limit.
        max_concurrent: usize,
    },
}

/// Server configuration.
///
/// Use [`ServerConfig::builder()`] to construct instances.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    http_addr: String,
    shutdown_timeout: Duration,
    idle_timeout: Option<Duration>,
    root_path: String,
    client_auth: ClientAuth,
    dispatch_mode: DispatchMode,
}

impl ServerConfig {
    /// Creates a new server configuration builder.
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Returns the HTTP bind address.
    #[must_use]
    pub fn http_addr(&self) -> &str {
        &self.http_addr
    }

    /// Parses the HTTP address as a `SocketAddr`.
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.http_addr.parse()
    }

    /// Returns how long shutdown waits for open connections.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Returns the per-connection idle timeout, if any.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Returns the normalized root resource path (`""` for `/`).
    #[must_use]
    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    /// Returns the client certificate policy for TLS connections.
    #[must_use]
    pub fn client_auth(&self) -> ClientAuth {
        self.client_auth
    }

    /// Returns where the dispatcher runs.
    #[must_use]
    pub fn dispatch_mode(&self) -> DispatchMode {
        self.dispatch_mode
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    http_addr: String,
    shutdown_timeout: Duration,
    idle_timeout: Option<Duration>,
    root_path: String,
    client_auth: ClientAuth,
    dispatch_mode: DispatchMode,
}

impl ServerConfigBuilder {
    /// Creates a builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            idle_timeout: None,
            root_path: String::new(),
            client_auth: ClientAuth::default(),
            dispatch_mode: DispatchMode::default(),
        }
    }

    /// Sets the HTTP bind address. Port `0` picks a free port; see
    /// [`Listening::local_addr`](crate::Listening::local_addr).
    #[must_use]
    pub fn http_addr(mut self, addr: impl Into<String>) -> Self {
        self.http_addr = addr.into();
        self
    }

    /// Sets how long shutdown waits for open connections to finish.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Closes connections that see no reads or writes for `timeout`.
    /// `None` disables the check.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the root resource path. `"/"` means unmounted; a missing leading
    /// slash is added.
    #[must_use]
    pub fn root_path(mut self, path: &str) -> Self {
        self.root_path = normalize_root_path(path);
        self
    }

    /// Sets the client certificate policy for TLS connections.
    #[must_use]
    pub fn client_auth(mut self, client_auth: ClientAuth) -> Self {
        self.client_auth = client_auth;
        self
    }

    /// Sets where the dispatcher runs.
    #[must_use]
    pub fn dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    /// Builds the [`ServerConfig`].
    #[must_use]
    pub fn build(self) -> ServerConfig {
        ServerConfig {
            http_addr: self.http_addr,
            shutdown_timeout: self.shutdown_timeout,
            idle_timeout: self.idle_timeout,
            root_path: self.root_path,
            client_auth: self.client_auth,
            dispatch_mode: self.dispatch_mode,
        }
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl From<ServerConfig> for ServerConfigBuilder {
    fn from(config: ServerConfig) -> Self {
        Self {
            http_addr: config.http_addr,
            shutdown_timeout: config.shutdown_timeout,
            idle_timeout: config.idle_timeout,
            root_path: config.root_path,
            client_auth: config.client_auth,
            dispatch_mode: config.dispatch_mode,
        }
    }
}
