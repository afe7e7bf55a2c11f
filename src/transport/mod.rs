//! Transport collaborators
//!
//! The pool never speaks HTTP itself. It asks a [`Transport`] registered for
//! the authority's scheme to open a [`Connection`], and the dispatcher sends
//! requests over that connection. Two providers ship with the crate:
//!
//! - [`HyperTransport`]: TCP + rustls + hyper HTTP/1.1 and HTTP/2
//! - [`MemoryTransport`]: in-process handler, for tests and embedding

pub mod memory;
pub mod tcp;

pub use memory::MemoryTransport;
pub use tcp::HyperTransport;

use crate::pool::Authority;
use crate::tls::TrustContext;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::{HeaderMap, Request, StatusCode, Version};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Errors raised by transport providers
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {authority}: {message}")]
    Connect { authority: String, message: String },

    #[error("TLS handshake with {authority} failed: {message}")]
    Handshake { authority: String, message: String },

    /// Writing the request failed
    #[error("Failed to send request: {0}")]
    Send(String),

    /// Reading the response failed
    #[error("Failed to read response: {0}")]
    Receive(String),

    #[error("Connection is closed")]
    Closed,

    #[error("No transport registered for scheme: {0}")]
    UnsupportedScheme(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the failure happened before a connection was established
    pub fn is_connect(&self) -> bool {
        matches!(
            self,
            TransportError::Connect { .. }
                | TransportError::Handshake { .. }
                | TransportError::UnsupportedScheme(_)
                | TransportError::Io(_)
        )
    }
}

/// A fully read response
#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ClientResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Body decoded as UTF-8, lossily
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// First value of a header, if it is valid visible ASCII
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Options applied when establishing a connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,

    /// Use HTTP/2 when the server agrees through ALPN
    pub enable_http2: bool,

    /// HTTP/1.1 read buffer limit in bytes
    pub max_buf_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            enable_http2: true,
            max_buf_size: 24 * 1024,
        }
    }
}

/// An open transport-level connection to one authority
#[async_trait]
pub trait Connection: Send {
    /// Whether the connection can still carry requests
    fn is_open(&self) -> bool;

    /// Send a request and read its response to completion.
    ///
    /// The request body, when present, is written and the stream ended before
    /// the response is awaited. Write failures surface as
    /// [`TransportError::Send`], read failures as [`TransportError::Receive`].
    async fn send(
        &mut self,
        request: Request<()>,
        body: Option<Bytes>,
    ) -> Result<ClientResponse, TransportError>;

    /// Close the connection. Callers treat failures as fire-and-forget.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens connections for one or more URI schemes
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        authority: &Authority,
        tls: Option<&TrustContext>,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// Scheme to transport mapping
#[derive(Clone)]
pub struct TransportRegistry {
    providers: HashMap<String, Arc<dyn Transport>>,
}

impl TransportRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// `http` and `https` served by [`HyperTransport`]
    pub fn with_defaults() -> Self {
        let hyper: Arc<dyn Transport> = Arc::new(HyperTransport::new());
        let mut registry = Self::new();
        registry.register("http", Arc::clone(&hyper));
        registry.register("https", hyper);
        registry
    }

    /// Serve every scheme the defaults cover with `transport`
    pub fn single(transport: Arc<dyn Transport>) -> Self {
        let mut registry = Self::new();
        registry.register("http", Arc::clone(&transport));
        registry.register("https", transport);
        registry
    }

    pub fn register(&mut self, scheme: &str, transport: Arc<dyn Transport>) {
        self.providers.insert(scheme.to_ascii_lowercase(), transport);
    }

    pub fn get(&self, scheme: &str) -> Result<Arc<dyn Transport>, TransportError> {
        self.providers
            .get(scheme)
            .cloned()
            .ok_or_else(|| TransportError::UnsupportedScheme(scheme.to_string()))
    }

    pub fn schemes(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
