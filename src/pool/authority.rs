//! Pool key: scheme + host + port of a downstream service

use hyper::Uri;
use std::fmt;
use std::str::FromStr;

/// Error produced when a URI cannot be turned into an [`Authority`]
#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error("Invalid URI {0}: {1}")]
    InvalidUri(String, String),

    #[error("URI has no scheme: {0}")]
    MissingScheme(String),

    #[error("URI has no host: {0}")]
    MissingHost(String),

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),
}

/// Destination of a pooled connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Authority {
    scheme: String,
    host: String,
    port: u16,
}

impl Authority {
    /// Build an authority from its parts; the scheme is lowercased.
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
        }
    }

    /// Derive the authority of an absolute URI, filling in the scheme's default port.
    pub fn from_uri(uri: &Uri) -> Result<Self, AuthorityError> {
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| AuthorityError::MissingScheme(uri.to_string()))?
            .to_ascii_lowercase();

        let port = match uri.port_u16() {
            Some(port) => port,
            None => default_port(&scheme)
                .ok_or_else(|| AuthorityError::UnsupportedScheme(scheme.clone()))?,
        };

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| AuthorityError::MissingHost(uri.to_string()))?;

        // IPv6 literals come back bracketed from `Uri::host`
        let host = host.trim_start_matches('[').trim_end_matches(']');

        Ok(Self::new(&scheme, host, port))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether connections to this authority require TLS
    pub fn is_secure(&self) -> bool {
        self.scheme == "https"
    }

    /// `host:port` suitable for socket connect
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Value for the `Host` header; the port is omitted when it is the scheme default.
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if default_port(&self.scheme) == Some(self.port) {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.socket_addr())
    }
}

impl FromStr for Authority {
    type Err = AuthorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri = s
            .parse::<Uri>()
            .map_err(|e| AuthorityError::InvalidUri(s.to_string(), e.to_string()))?;
        Self::from_uri(&uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        let a: Authority = "https://petstore.example.com/v1/pets".parse().unwrap();
        assert_eq!(a.port(), 443);
        assert!(a.is_secure());
        assert_eq!(a.host_header(), "petstore.example.com");

        let a: Authority = "http://localhost:8080".parse().unwrap();
        assert_eq!(a.port(), 8080);
        assert!(!a.is_secure());
        assert_eq!(a.host_header(), "localhost:8080");
        assert_eq!(a.to_string(), "http://localhost:8080");
    }

    #[test]
    fn test_same_destination_same_key() {
        let a: Authority = "HTTPS://Example.com:443/a".parse().unwrap();
        let b: Authority = "https://example.com/b?x=1".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_relative_and_unknown() {
        assert!(matches!(
            "/v1/pets".parse::<Authority>(),
            Err(AuthorityError::MissingScheme(_))
        ));
        assert!(matches!(
            "ftp://example.com".parse::<Authority>(),
            Err(AuthorityError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_ipv6_literal() {
        let a: Authority = "http://[::1]:9000/".parse().unwrap();
        assert_eq!(a.host(), "::1");
        assert_eq!(a.socket_addr(), "[::1]:9000");
        assert_eq!(a.host_header(), "[::1]:9000");
    }
}
