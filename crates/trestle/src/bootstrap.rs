//! Turning a [`TrestleConfig`] into a running server.

use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::rustls::ServerConfig as RustlsConfig;
use tracing::info;
use trestle_config::{ClientAuthMode, ConfigError, ConfigLoader, DispatchKind, TrestleConfig};
use trestle_core::Dispatcher;
use trestle_server::{ClientAuth, DispatchMode, ServerBuilder, ServerError, ShutdownSignal};
use trestle_telemetry::{init_telemetry, TelemetryError};

/// Configuration file read by [`Trestle::load`] when present.
pub const DEFAULT_CONFIG_FILE: &str = "trestle.toml";

/// Environment prefix used by [`Trestle::load`].
pub const DEFAULT_ENV_PREFIX: &str = "TRESTLE";

/// Errors raised while starting a server from configuration.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Logging or metrics could not be installed.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    /// The server could not be built, bound or run.
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Maps the configured client certificate policy.
#[must_use]
pub fn client_auth(mode: ClientAuthMode) -> ClientAuth {
    match mode {
        ClientAuthMode::None => ClientAuth::None,
        ClientAuthMode::Optional => ClientAuth::Optional,
        ClientAuthMode::Require => ClientAuth::Require,
    }
}

/// Maps the configured dispatch mode.
#[must_use]
pub fn dispatch_mode(config: &TrestleConfig) -> DispatchMode {
    match config.server.dispatch_mode {
        DispatchKind::Inline => DispatchMode::Inline,
        DispatchKind::Offload => DispatchMode::Offload {
            max_concurrent: config.server.max_offload_workers,
        },
    }
}

/// Returns a [`ServerBuilder`] carrying every server setting from `config`.
/// The dispatcher, cleanup tasks and TLS still have to be supplied.
#[must_use]
pub fn server_builder(config: &TrestleConfig) -> ServerBuilder {
    ServerBuilder::default()
        .http_addr(config.server.http_addr.clone())
        .shutdown_timeout(config.shutdown_timeout())
        .idle_timeout(config.idle_timeout())
        .root_path(&config.server.root_path)
        .client_auth(client_auth(config.server.client_auth))
        .dispatch_mode(dispatch_mode(config))
}

/// A configured application: settings plus the server being assembled.
///
/// # Example
///
/// ```rust,no_run
/// use trestle::prelude::*;
/// use trestle::Trestle;
///
/// #[tokio::main]
/// async fn main() -> Result<(), trestle::BootstrapError> {
///     Trestle::load()?
///         .dispatcher(dispatch_fn(|request, _body, response| {
///             response.write(request.uri().to_string())?;
///             Ok(())
///         }))
///         .run()
///         .await
/// }
/// ```
pub struct Trestle {
    config: TrestleConfig,
    builder: ServerBuilder,
}

impl Trestle {
    /// Validates `config` and prepares a server builder from it.
    ///
    /// # Errors
    ///
    /// Returns `BootstrapError::Config` if validation fails.
    pub fn from_config(config: TrestleConfig) -> Result<Self, BootstrapError> {
        config.validate()?;
        let builder = server_builder(&config);
        Ok(Self { config, builder })
    }

    /// Loads `.env`, then [`DEFAULT_CONFIG_FILE`] if it exists, then
    /// `TRESTLE__*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `BootstrapError::Config` if any layer fails.
    pub fn load() -> Result<Self, BootstrapError> {
        let config = ConfigLoader::new()
            .with_dotenv()?
            .with_optional_file(DEFAULT_CONFIG_FILE)?
            .with_env_prefix(DEFAULT_ENV_PREFIX)
            .load()?;
        Self::from_config(config)
    }

    /// The loaded configuration.
    #[must_use]
    pub fn config(&self) -> &TrestleConfig {
        &self.config
    }

    /// Sets the dispatcher.
    #[must_use]
    pub fn dispatcher(self, dispatcher: impl Dispatcher) -> Self {
        self.configure(|builder| builder.dispatcher(dispatcher))
    }

    /// Terminates TLS with `tls`, enforcing the configured client policy.
    #[must_use]
    pub fn tls(self, tls: Arc<RustlsConfig>) -> Self {
        self.configure(|builder| builder.tls(tls))
    }

    /// Adjusts the server builder directly, e.g. to add cleanup tasks.
    #[must_use]
    pub fn configure(mut self, f: impl FnOnce(ServerBuilder) -> ServerBuilder) -> Self {
        self.builder = f(self.builder);
        self
    }

    /// Installs telemetry and serves until SIGINT or SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns `BootstrapError` if telemetry, building or binding fails.
    pub async fn run(self) -> Result<(), BootstrapError> {
        self.run_with_shutdown(ShutdownSignal::with_os_signals()).await
    }

    /// Installs telemetry and serves until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns `BootstrapError` if telemetry, building or binding fails.
    pub async fn run_with_shutdown(self, shutdown: ShutdownSignal) -> Result<(), BootstrapError> {
        let telemetry = init_telemetry(self.config.telemetry_config())?;
        let listening = self.builder.build()?.bind().await?;

        info!(
            addr = %listening.local_addr(),
            service = %self.config.telemetry.service_name,
            environment = %self.config.telemetry.environment,
            "trestle listening"
        );

        listening.serve_with_shutdown(shutdown).await?;
        drop(telemetry);
        Ok(())
    }
}

impl std::fmt::Debug for Trestle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trestle")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use trestle_config::ServerSection;
    use trestle_core::dispatch_fn;

    fn ok_dispatcher() -> impl Dispatcher {
        dispatch_fn(|_, _, _| Ok(()))
    }

    #[test]
    fn test_client_auth_mapping() {
        assert_eq!(client_auth(ClientAuthMode::None), ClientAuth::None);
        assert_eq!(client_auth(ClientAuthMode::Optional), ClientAuth::Optional);
        assert_eq!(client_auth(ClientAuthMode::Require), ClientAuth::Require);
    }

    #[test]
    fn test_dispatch_mode_mapping() {
        let mut config = TrestleConfig::default();
        assert_eq!(dispatch_mode(&config), DispatchMode::Inline);

        config.server.dispatch_mode = DispatchKind::Offload;
        config.server.max_offload_workers = 4;
        assert_eq!(dispatch_mode(&config), DispatchMode::Offload { max_concurrent: 4 });
    }

    #[test]
    fn test_server_builder_carries_settings() {
        let config = TrestleConfig::builder()
            .server(ServerSection {
                http_addr: "127.0.0.1:0".to_string(),
                shutdown_timeout_secs: 3,
                idle_timeout_ms: Some(250),
                root_path: "api/".to_string(),
                client_auth: ClientAuthMode::Optional,
                ..Default::default()
            })
            .build();

        let server = server_builder(&config).dispatcher(ok_dispatcher()).build().unwrap();
        let settings = server.config();

        assert_eq!(settings.http_addr(), "127.0.0.1:0");
        assert_eq!(settings.shutdown_timeout(), Duration::from_secs(3));
        assert_eq!(settings.idle_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(settings.root_path(), "/api");
        assert_eq!(settings.client_auth(), ClientAuth::Optional);
        assert_eq!(server.bridge().context_path(), "/api");
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let mut config = TrestleConfig::default();
        config.server.http_addr = "nowhere".to_string();
        assert!(matches!(
            Trestle::from_config(config),
            Err(BootstrapError::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[tokio::test]
    async fn test_run_without_dispatcher_fails() {
        let mut config = TrestleConfig::default();
        config.telemetry.logging.enabled = false;
        config.telemetry.metrics.enabled = false;

        let result = Trestle::from_config(config)
            .unwrap()
            .run_with_shutdown(ShutdownSignal::new())
            .await;

        assert!(matches!(
            result,
            Err(BootstrapError::Server(ServerError::MissingDispatcher))
        ));
    }
}
