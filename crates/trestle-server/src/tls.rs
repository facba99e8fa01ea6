//! TLS termination and client certificate policy.
//!
//! Callers hand over a ready [`rustls::ServerConfig`](tokio_rustls::rustls::ServerConfig);
//! certificate loading is their business. The server performs the handshake
//! per connection and then applies the [`ClientAuth`] policy to whatever
//! client certificate rustls accepted.

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::ServerConfig as RustlsConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Client certificate requirement for TLS connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuth {
    /// Client certificates are not checked.
    None,
    /// A certificate is accepted if presented but not required.
    Optional,
    /// Connections without a client certificate are closed.
    #[default]
    Require,
}

impl ClientAuth {
    /// Returns `true` if a connection that did (or did not) present a
    /// certificate may proceed.
    #[must_use]
    pub const fn permits(self, presented: bool) -> bool {
        match self {
            Self::None | Self::Optional => true,
            Self::Require => presented,
        }
    }
}

impl std::str::FromStr for ClientAuth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "optional" => Ok(Self::Optional),
            "require" | "required" => Ok(Self::Require),
            other => Err(format!("unknown client auth mode `{other}`")),
        }
    }
}

/// Accepts TLS connections and enforces a [`ClientAuth`] policy.
#[derive(Clone)]
pub struct TlsTerminator {
    acceptor: TlsAcceptor,
    client_auth: ClientAuth,
}

impl TlsTerminator {
    /// Creates a terminator from a rustls configuration.
    ///
    /// For [`ClientAuth::Require`] the rustls config should carry a client
    /// certificate verifier; without one no client ever presents a
    /// certificate and every connection is refused.
    #[must_use]
    pub fn new(config: Arc<RustlsConfig>, client_auth: ClientAuth) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
            client_auth,
        }
    }

    /// Returns the policy in force.
    #[must_use]
    pub const fn client_auth(&self) -> ClientAuth {
        self.client_auth
    }

    /// Runs the handshake and checks the client certificate policy.
    pub async fn accept<IO>(&self, io: IO) -> io::Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = self.acceptor.accept(io).await?;
        let presented = stream
            .get_ref()
            .1
            .peer_certificates()
            .is_some_and(|certs| !certs.is_empty());
        if !self.client_auth.permits(presented) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "client certificate required",
            ));
        }
        Ok(stream)
    }
}

impl std::fmt::Debug for TlsTerminator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTerminator")
            .field("client_auth", &self.client_auth)
            .finish_non_exhaustive()
    }
}
