//! Absolute request URI reconstruction.
//!
//! HTTP/1 requests normally carry only a path and query on the request line.
//! The dispatch pipeline wants an absolute URI, so one is rebuilt from the
//! connection scheme, the resolved host and port, and the raw request target.
//! The target is appended verbatim: no normalization, no percent-decoding.

use crate::error::BridgeError;
use http::uri::Authority;
use http::{HeaderMap, Uri};
use std::net::{IpAddr, SocketAddr};

/// Builds the absolute URI text for a request.
///
/// If `target` already starts with `"<scheme>://"` it is returned unchanged.
///
/// # Example
///
/// ```
/// use trestle_core::uri::reconstruct_uri;
///
/// assert_eq!(
///     reconstruct_uri("http", "example.com", 8080, "/foo?x=1"),
///     "http://example.com:8080/foo?x=1"
/// );
/// ```
#[must_use]
pub fn reconstruct_uri(scheme: &str, host: &str, port: u16, target: &str) -> String {
    if target
        .strip_prefix(scheme)
        .is_some_and(|rest| rest.starts_with("://"))
    {
        return target.to_string();
    }

    let mut uri = String::with_capacity(scheme.len() + host.len() + target.len() + 9);
    uri.push_str(scheme);
    uri.push_str("://");
    uri.push_str(host);
    uri.push(':');
    uri.push_str(&port.to_string());
    uri.push_str(target);
    uri
}

/// Like [`reconstruct_uri`], parsed into an [`http::Uri`].
pub fn absolute_uri(scheme: &str, host: &str, port: u16, target: &str) -> Result<Uri, BridgeError> {
    let text = reconstruct_uri(scheme, host, port, target);
    text.parse::<Uri>()
        .map_err(|_| BridgeError::InvalidUri { uri: text })
}

/// Returns the default port for a scheme.
#[must_use]
pub fn default_port(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") {
        443
    } else {
        80
    }
}

/// Formats an IP address for use as a URI host, bracketing IPv6 literals.
#[must_use]
pub fn format_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

/// Resolves the host and port a request was addressed to.
///
/// The authority of an absolute-form target wins, then the `Host` header.
/// A host without a port gets the scheme's default port. Requests carrying
/// neither fall back to the local socket address.
#[must_use]
pub fn resolve_host(
    uri: &Uri,
    headers: &HeaderMap,
    scheme: &str,
    local_addr: SocketAddr,
) -> (String, u16) {
    let from_header = || {
        headers
            .get(http::header::HOST)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<Authority>().ok())
    };

    match uri.authority().cloned().or_else(from_header) {
        Some(authority) if !authority.host().is_empty() => {
            let port = authority.port_u16().unwrap_or_else(|| default_port(scheme));
            (authority.host().to_string(), port)
        }
        _ => (format_host(local_addr.ip()), local_addr.port()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use proptest::prelude::*;

    fn local() -> SocketAddr {
        "10.0.0.5:9000".parse().unwrap()
    }

    #[test]
    fn test_origin_form_is_prefixed() {
        assert_eq!(
            reconstruct_uri("http", "example.com", 8080, "/foo?x=1"),
            "http://example.com:8080/foo?x=1"
        );
        assert_eq!(
            reconstruct_uri("https", "api.local", 443, "/"),
            "https://api.local:443/"
        );
    }

    #[test]
    fn test_absolute_target_passes_through() {
        let target = "http://upstream.example/path?q=2";
        assert_eq!(reconstruct_uri("http", "ignored", 1, target), target);
    }

    #[test]
    fn test_other_scheme_prefix_is_not_absolute() {
        // An https target on a plain connection is still treated as a path.
        assert_eq!(
            reconstruct_uri("http", "h", 80, "https://x/"),
            "http://h:80https://x/"
        );
    }

    #[test]
    fn test_target_is_not_normalized() {
        assert_eq!(
            reconstruct_uri("http", "h", 80, "/a/../b%20c?x=%2F"),
            "http://h:80/a/../b%20c?x=%2F"
        );
    }

    #[test]
    fn test_absolute_uri_parses() {
        let uri = absolute_uri("http", "example.com", 8080, "/foo?x=1").unwrap();
        assert_eq!(uri.scheme_str(), Some("http"));
        assert_eq!(uri.host(), Some("example.com"));
        assert_eq!(uri.port_u16(), Some(8080));
        assert_eq!(uri.path(), "/foo");
        assert_eq!(uri.query(), Some("x=1"));
    }

    #[test]
    fn test_absolute_uri_rejects_garbage() {
        let error = absolute_uri("http", "exa mple", 80, "/").unwrap_err();
        assert!(matches!(error, BridgeError::InvalidUri { .. }));
    }

    #[test]
    fn test_ipv6_host_is_bracketed() {
        let addr: SocketAddr = "[::1]:8443".parse().unwrap();
        let (host, port) = resolve_host(&Uri::from_static("/"), &HeaderMap::new(), "https", addr);
        assert_eq!(host, "[::1]");
        assert_eq!(port, 8443);
        assert_eq!(
            reconstruct_uri("https", &host, port, "/x"),
            "https://[::1]:8443/x"
        );
    }

    #[test]
    fn test_host_header_wins_over_local_address() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, HeaderValue::from_static("example.com:8080"));
        let resolved = resolve_host(&Uri::from_static("/foo"), &headers, "http", local());
        assert_eq!(resolved, ("example.com".to_string(), 8080));
    }

    #[test]
    fn test_host_header_without_port_uses_scheme_default() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, HeaderValue::from_static("example.com"));
        assert_eq!(
            resolve_host(&Uri::from_static("/"), &headers, "https", local()),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            resolve_host(&Uri::from_static("/"), &headers, "http", local()),
            ("example.com".to_string(), 80)
        );
    }

    #[test]
    fn test_missing_host_falls_back_to_local_address() {
        let resolved = resolve_host(&Uri::from_static("/"), &HeaderMap::new(), "http", local());
        assert_eq!(resolved, ("10.0.0.5".to_string(), 9000));
    }

    #[test]
    fn test_absolute_form_authority_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, HeaderValue::from_static("other.example"));
        let uri = Uri::from_static("http://proxy.example:3128/p");
        assert_eq!(
            resolve_host(&uri, &headers, "http", local()),
            ("proxy.example".to_string(), 3128)
        );
    }

    proptest! {
        #[test]
        fn prop_origin_form_round_trips(
            host in "[a-z]{1,12}(\\.[a-z]{2,6})?",
            port in 1u16..,
            path in "(/[a-zA-Z0-9_-]{0,8}){1,4}",
            query in proptest::option::of("[a-z]{1,5}=[a-z0-9]{0,5}"),
        ) {
            let target = match &query {
                Some(q) => format!("{path}?{q}"),
                None => path.clone(),
            };
            let uri = absolute_uri("http", &host, port, &target).unwrap();
            prop_assert_eq!(uri.host(), Some(host.as_str()));
            prop_assert_eq!(uri.port_u16(), Some(port));
            prop_assert_eq!(uri.path(), path.as_str());
            prop_assert_eq!(uri.query(), query.as_deref());
        }

        #[test]
        fn prop_absolute_targets_are_untouched(rest in "[a-z]{1,10}(:[0-9]{2,5})?/[a-z]{0,10}") {
            let target = format!("https://{rest}");
            prop_assert_eq!(reconstruct_uri("https", "h", 1, &target), target);
        }
    }
}
