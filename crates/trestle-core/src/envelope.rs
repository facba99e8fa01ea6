//! Per-request context handed to the dispatcher.
//!
//! The [`RequestEnvelope`] is built once from the request head and the
//! connection it arrived on, and is read-only afterwards.

use crate::error::BridgeError;
use crate::uri;
use http::{HeaderMap, Method, Uri, Version};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// A unique identifier for each request, using UUID v7.
///
/// UUID v7 is time-ordered, which keeps log lines for consecutive requests
/// sorted.
///
/// # Example
///
/// ```
/// use trestle_core::RequestId;
///
/// let id = RequestId::new();
/// assert_eq!(id.to_string().len(), 36);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Creates a new request ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Addresses and security of the connection a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    secure: bool,
}

impl ConnectionInfo {
    /// Creates connection info for a plain-text connection.
    #[must_use]
    pub const fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            remote_addr,
            secure: false,
        }
    }

    /// Marks the connection as TLS-protected.
    #[must_use]
    pub const fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Returns the local socket address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the peer socket address.
    #[must_use]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Returns `true` for TLS connections.
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        self.secure
    }

    /// Returns the URI scheme for requests on this connection.
    #[must_use]
    pub const fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }
}

/// Normalizes a root resource path.
///
/// `"/"` and `""` become `""`; any other value gets a leading `/` if it lacks
/// one and loses a trailing `/`.
///
/// # Example
///
/// ```
/// use trestle_core::envelope::normalize_root_path;
///
/// assert_eq!(normalize_root_path("/"), "");
/// assert_eq!(normalize_root_path("api"), "/api");
/// ```
#[must_use]
pub fn normalize_root_path(root: &str) -> String {
    let trimmed = root.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Immutable per-request context.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    request_id: RequestId,
    method: Method,
    version: Version,
    scheme: &'static str,
    host: String,
    port: u16,
    target: String,
    uri: Arc<Uri>,
    headers: HeaderMap,
    remote_addr: Option<SocketAddr>,
    context_path: String,
    received_at: Instant,
}

impl RequestEnvelope {
    /// Builds an envelope from a request head and its connection.
    ///
    /// `context_path` must already be normalized with [`normalize_root_path`].
    pub fn from_parts(
        request_id: RequestId,
        parts: &http::request::Parts,
        conn: &ConnectionInfo,
        context_path: &str,
    ) -> Result<Self, BridgeError> {
        let scheme = conn.scheme();
        let (host, port) = uri::resolve_host(&parts.uri, &parts.headers, scheme, conn.local_addr());
        let target = request_target(&parts.uri);
        let absolute = uri::absolute_uri(scheme, &host, port, &target)?;

        Ok(Self {
            request_id,
            method: parts.method.clone(),
            version: parts.version,
            scheme,
            host,
            port,
            target,
            uri: Arc::new(absolute),
            headers: parts.headers.clone(),
            remote_addr: Some(conn.remote_addr()),
            context_path: context_path.to_string(),
            received_at: Instant::now(),
        })
    }

    /// Starts building an envelope by hand, mostly useful in dispatcher tests.
    #[must_use]
    pub fn builder() -> RequestEnvelopeBuilder {
        RequestEnvelopeBuilder::default()
    }

    /// Returns the request ID.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Returns the request method.
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the HTTP version.
    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Returns `"http"` or `"https"`.
    #[must_use]
    pub const fn scheme(&self) -> &'static str {
        self.scheme
    }

    /// Returns the resolved host, bracketed for IPv6 literals.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the resolved port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the request target as it appeared on the request line.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns the reconstructed absolute URI.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Returns a shared handle to the absolute URI.
    #[must_use]
    pub fn shared_uri(&self) -> Arc<Uri> {
        Arc::clone(&self.uri)
    }

    /// Returns the request path.
    #[must_use]
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Returns the query string, if any.
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Returns the request headers.
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the peer address, when known.
    #[must_use]
    pub const fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Returns the normalized root resource path (`""` when mounted at `/`).
    #[must_use]
    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    /// Returns the path below the context path, or `None` if the request is
    /// outside of it.
    #[must_use]
    pub fn relative_path(&self) -> Option<&str> {
        let path = self.path();
        if self.context_path.is_empty() {
            return Some(path);
        }
        match path.strip_prefix(self.context_path.as_str()) {
            Some("") => Some("/"),
            Some(rest) if rest.starts_with('/') => Some(rest),
            _ => None,
        }
    }

    /// Returns the time elapsed since the envelope was built.
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.received_at.elapsed()
    }
}

fn request_target(uri: &Uri) -> String {
    if uri.scheme().is_some() {
        return uri.to_string();
    }
    uri.path_and_query()
        .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string())
}

/// Builder for [`RequestEnvelope`].
#[derive(Debug, Default)]
pub struct RequestEnvelopeBuilder {
    method: Option<Method>,
    target: Option<String>,
    headers: HeaderMap,
    scheme: Option<&'static str>,
    host: Option<String>,
    port: Option<u16>,
    context_path: String,
    remote_addr: Option<SocketAddr>,
}

impl RequestEnvelopeBuilder {
    /// Sets the method (default `GET`).
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Sets the request target (default `/`).
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Adds a header.
    pub fn header(mut self, name: http::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Marks the request as arriving over TLS.
    pub fn secure(mut self) -> Self {
        self.scheme = Some("https");
        self
    }

    /// Sets host and port (default `localhost` and the scheme's default port).
    pub fn authority(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }

    /// Sets the root resource path, normalizing it.
    pub fn context_path(mut self, root: &str) -> Self {
        self.context_path = normalize_root_path(root);
        self
    }

    /// Sets the peer address.
    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Builds the envelope.
    pub fn build(self) -> Result<RequestEnvelope, BridgeError> {
        let scheme = self.scheme.unwrap_or("http");
        let host = self.host.unwrap_or_else(|| "localhost".to_string());
        let port = self.port.unwrap_or_else(|| uri::default_port(scheme));
        let target = self.target.unwrap_or_else(|| "/".to_string());
        let absolute = uri::absolute_uri(scheme, &host, port, &target)?;

        Ok(RequestEnvelope {
            request_id: RequestId::new(),
            method: self.method.unwrap_or(Method::GET),
            version: Version::HTTP_11,
            scheme,
            host,
            port,
            target,
            uri: Arc::new(absolute),
            headers: self.headers,
            remote_addr: self.remote_addr,
            context_path: self.context_path,
            received_at: Instant::now(),
        })
    }
}
