//! Listener loop hosting the [`Bridge`].
//!
//! # Architecture
//!
//! - TCP listener bound to the configured address
//! - One task per connection: optional TLS handshake, idle supervision, and
//!   a hyper HTTP/1 connection whose service is the bridge
//! - Graceful shutdown: stop accepting, then wait for connections to drain
//!
//! # Example
//!
//! ```rust,ignore
//! use trestle_server::Server;
//! use trestle_core::dispatch_fn;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::builder()
//!         .http_addr("0.0.0.0:8080")
//!         .dispatcher(dispatch_fn(|_request, _body, response| {
//!             response.write("hello")?;
//!             Ok(())
//!         }))
//!         .build()?;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

use std::io;
use std::net::{AddrParseError, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::ServerConfig as RustlsConfig;
use trestle_core::{CleanupTask, ConnectionInfo, Dispatcher, ProviderContext, ReleaseHook};
use trestle_telemetry::metrics::record_idle_close;

use crate::bridge::{Bridge, BridgeBuilder};
use crate::config::{DispatchMode, ServerConfig, ServerConfigBuilder};
use crate::idle::IdleSupervisor;
use crate::shutdown::{ConnectionTracker, ShutdownSignal};
use crate::tls::{ClientAuth, TlsTerminator};

/// Errors from building or running a [`Server`].
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The configured bind address does not parse.
    #[error("invalid bind address `{addr}`")]
    InvalidAddress {
        /// The configured address.
        addr: String,
        /// Parse failure.
        #[source]
        source: AddrParseError,
    },

    /// The listener could not be bound.
    #[error("failed to bind to {addr}")]
    Bind {
        /// The address that was tried.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// [`ServerBuilder::build`] was called without a dispatcher.
    #[error("no dispatcher configured")]
    MissingDispatcher,

    /// Any other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The Trestle HTTP server.
pub struct Server {
    config: ServerConfig,
    bridge: Arc<Bridge>,
    tls: Option<TlsTerminator>,
}

impl Server {
    /// Creates a new server builder.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Returns the server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the bridge shared by all connections.
    #[must_use]
    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Returns `true` if connections are TLS-terminated.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Binds the listener without accepting yet.
    pub async fn bind(self) -> Result<Listening, ServerError> {
        let addr = self
            .config
            .socket_addr()
            .map_err(|source| ServerError::InvalidAddress {
                addr: self.config.http_addr().to_string(),
                source,
            })?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        tracing::info!(
            %local_addr,
            secure = self.is_secure(),
            root_path = self.config.root_path(),
            "server listening"
        );

        Ok(Listening {
            listener,
            local_addr,
            server: self,
        })
    }

    /// Runs until SIGTERM or SIGINT.
    pub async fn run(self) -> Result<(), ServerError> {
        self.bind().await?.serve().await
    }

    /// Runs until `shutdown` is triggered.
    pub async fn run_with_shutdown(self, shutdown: ShutdownSignal) -> Result<(), ServerError> {
        self.bind().await?.serve_with_shutdown(shutdown).await
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, local_addr: SocketAddr, remote_addr: SocketAddr, shutdown: ShutdownSignal) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!(error = %e, "failed to set TCP_NODELAY");
        }
        let local_addr = stream.local_addr().unwrap_or(local_addr);
        let supervisor = IdleSupervisor::new(self.config.idle_timeout());
        let info = ConnectionInfo::new(local_addr, remote_addr);
        let io = supervisor.wrap(stream);

        let Some(tls) = &self.tls else {
            return self.drive(io, info, &supervisor, shutdown).await;
        };

        let handshake = tokio::select! {
            result = tls.accept(io) => result,
            () = supervisor.expired() => {
                record_idle_close();
                tracing::debug!(%remote_addr, "TLS handshake idle, closing");
                return;
            }
            () = shutdown.recv() => return,
        };
        match handshake {
            Ok(stream) => self.drive(stream, info.with_secure(true), &supervisor, shutdown).await,
            Err(e) => tracing::debug!(%remote_addr, error = %e, "TLS handshake failed"),
        }
    }

    async fn drive<IO>(&self, io: IO, info: ConnectionInfo, supervisor: &IdleSupervisor, shutdown: ShutdownSignal)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let bridge = Arc::clone(&self.bridge);
        let service = service_fn(move |request: Request<Incoming>| Arc::clone(&bridge).serve(request, info));
        let conn = http1::Builder::new().serve_connection(TokioIo::new(io), service);
        tokio::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(remote_addr = %info.remote_addr(), error = %e, "connection error");
                }
            }
            () = supervisor.expired() => {
                record_idle_close();
                tracing::debug!(
                    remote_addr = %info.remote_addr(),
                    idle_for = ?supervisor.clock().idle_for(),
                    "closing idle connection"
                );
            }
            () = shutdown.recv() => {
                conn.as_mut().graceful_shutdown();
                if let Err(e) = conn.await {
                    tracing::debug!(remote_addr = %info.remote_addr(), error = %e, "connection error during shutdown");
                }
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("bridge", &self.bridge)
            .field("tls", &self.tls)
            .finish()
    }
}

/// A bound server that has not started accepting yet.
#[derive(Debug)]
pub struct Listening {
    listener: TcpListener,
    local_addr: SocketAddr,
    server: Server,
}

impl Listening {
    /// Returns the bound address; useful with port `0`.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until SIGTERM or SIGINT.
    pub async fn serve(self) -> Result<(), ServerError> {
        self.serve_with_shutdown(ShutdownSignal::with_os_signals()).await
    }

    /// Accepts connections until `shutdown` is triggered, then waits up to
    /// the shutdown timeout for open connections to finish.
    pub async fn serve_with_shutdown(self, shutdown: ShutdownSignal) -> Result<(), ServerError> {
        let Self {
            listener,
            local_addr,
            server,
        } = self;
        let server = Arc::new(server);
        let tracker = ConnectionTracker::new();

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, remote_addr)) => {
                        let token = tracker.acquire();
                        let server = Arc::clone(&server);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            server.serve_connection(stream, local_addr, remote_addr, shutdown).await;
                            drop(token);
                        });
                    }
                    Err(e) => tracing::error!(error = %e, "failed to accept connection"),
                },
                () = shutdown.recv() => {
                    tracing::info!("shutdown signal received, no longer accepting");
                    break;
                }
            }
        }
        drop(listener);

        let timeout = server.config.shutdown_timeout();
        tracing::info!(
            connections = tracker.active_connections(),
            ?timeout,
            "waiting for connections to close"
        );
        if tokio::time::timeout(timeout, tracker.drained()).await.is_err() {
            tracing::warn!(
                connections = tracker.active_connections(),
                "shutdown timeout reached with connections still open"
            );
        }

        tracing::info!("server stopped");
        Ok(())
    }
}

/// Builder for [`Server`].
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use trestle_core::dispatch_fn;
/// use trestle_server::Server;
///
/// let server = Server::builder()
///     .http_addr("127.0.0.1:0")
///     .idle_timeout(Some(Duration::from_secs(30)))
///     .dispatcher(dispatch_fn(|_, _, response| {
///         response.write("ok")?;
///         Ok(())
///     }))
///     .build()
///     .unwrap();
/// assert!(!server.is_secure());
/// ```
#[derive(Default)]
pub struct ServerBuilder {
    config: ServerConfigBuilder,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    cleanup: Vec<CleanupTask>,
    context: Option<ProviderContext>,
    release_hook: Option<ReleaseHook>,
    tls: Option<Arc<RustlsConfig>>,
}

impl ServerBuilder {
    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config.into();
        self
    }

    /// Sets the HTTP bind address.
    #[must_use]
    pub fn http_addr(mut self, addr: impl Into<String>) -> Self {
        self.config = self.config.http_addr(addr);
        self
    }

    /// Sets how long shutdown waits for open connections.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.shutdown_timeout(timeout);
        self
    }

    /// Sets the per-connection idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config = self.config.idle_timeout(timeout);
        self
    }

    /// Sets the root resource path.
    #[must_use]
    pub fn root_path(mut self, path: &str) -> Self {
        self.config = self.config.root_path(path);
        self
    }

    /// Sets the client certificate policy for TLS connections.
    #[must_use]
    pub fn client_auth(mut self, client_auth: ClientAuth) -> Self {
        self.config = self.config.client_auth(client_auth);
        self
    }

    /// Sets where the dispatcher runs.
    #[must_use]
    pub fn dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.config = self.config.dispatch_mode(mode);
        self
    }

    /// Sets the dispatcher. Required.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: impl Dispatcher) -> Self {
        self.dispatcher = Some(Arc::new(dispatcher));
        self
    }

    /// Sets an already shared dispatcher.
    #[must_use]
    pub fn shared_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Appends a task run after every dispatch.
    #[must_use]
    pub fn cleanup_task(mut self, task: CleanupTask) -> Self {
        self.cleanup.push(task);
        self
    }

    /// Sets the context made current during dispatch.
    #[must_use]
    pub fn provider_context(mut self, context: ProviderContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Sets a hook called once per request body release.
    #[must_use]
    pub fn release_hook(mut self, hook: ReleaseHook) -> Self {
        self.release_hook = Some(hook);
        self
    }

    /// Enables TLS with a ready rustls configuration.
    #[must_use]
    pub fn tls(mut self, config: Arc<RustlsConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Builds the server.
    pub fn build(self) -> Result<Server, ServerError> {
        let dispatcher = self.dispatcher.ok_or(ServerError::MissingDispatcher)?;
        let config = self.config.build();

        let mut bridge = BridgeBuilder::new(dispatcher)
            .cleanup_tasks(self.cleanup)
            .context_path(config.root_path())
            .dispatch_mode(config.dispatch_mode());
        if let Some(context) = self.context {
            bridge = bridge.provider_context(context);
        }
        if let Some(hook) = self.release_hook {
            bridge = bridge.release_hook(hook);
        }

        let tls = self
            .tls
            .map(|rustls| TlsTerminator::new(rustls, config.client_auth()));

        Ok(Server {
            bridge: Arc::new(bridge.build()),
            tls,
            config,
        })
    }
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher.is_some())
            .field("cleanup_tasks", &self.cleanup.len())
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}
