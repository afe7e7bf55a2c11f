//! TCP transport backed by hyper and rustls
//!
//! - Plain `http` authorities speak HTTP/1.1
//! - `https` authorities negotiate ALPN; `h2` selects HTTP/2 when enabled
//! - TCP keep-alive and `TCP_NODELAY` are set on every socket

use super::{ClientResponse, ConnectOptions, Connection, Transport, TransportError};
use crate::pool::Authority;
use crate::tls::TrustContext;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::{http1, http2};
use hyper::{Request, Uri, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Smallest read buffer hyper's HTTP/1 codec accepts
const MIN_BUF_SIZE: usize = 8192;

/// Connects over TCP, optionally wrapping the stream in TLS
#[derive(Debug, Default, Clone)]
pub struct HyperTransport;

impl HyperTransport {
    pub fn new() -> Self {
        Self
    }

    async fn open_tcp(
        authority: &Authority,
        options: &ConnectOptions,
    ) -> Result<TcpStream, TransportError> {
        let addr = authority.socket_addr();
        let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Connect {
                authority: authority.to_string(),
                message: "Connection timeout".to_string(),
            })?
            .map_err(|e| TransportError::Connect {
                authority: authority.to_string(),
                message: e.to_string(),
            })?;

        stream.set_nodelay(true)?;

        // Configure TCP keep-alive
        let socket = socket2::Socket::from(stream.into_std()?);
        socket.set_keepalive(true)?;
        Ok(TcpStream::from_std(socket.into())?)
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn connect(
        &self,
        authority: &Authority,
        tls: Option<&TrustContext>,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, TransportError> {
        debug!(authority = %authority, "Creating new connection");
        let stream = Self::open_tcp(authority, options).await?;

        if !authority.is_secure() {
            let conn = HyperConnection::http1(authority, TokioIo::new(stream), options).await?;
            return Ok(Box::new(conn));
        }

        let trust = tls.ok_or_else(|| TransportError::Handshake {
            authority: authority.to_string(),
            message: "no trust context available".to_string(),
        })?;

        let server_name = ServerName::try_from(authority.host().to_string()).map_err(|e| {
            TransportError::Handshake {
                authority: authority.to_string(),
                message: e.to_string(),
            }
        })?;

        let handshake = TlsConnector::from(trust.client_config()).connect(server_name, stream);
        let tls_stream = tokio::time::timeout(options.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::Handshake {
                authority: authority.to_string(),
                message: "TLS handshake timeout".to_string(),
            })?
            .map_err(|e| TransportError::Handshake {
                authority: authority.to_string(),
                message: e.to_string(),
            })?;

        let negotiated_h2 = tls_stream.get_ref().1.alpn_protocol() == Some(&b"h2"[..]);
        let io = TokioIo::new(tls_stream);

        let conn = if negotiated_h2 && options.enable_http2 {
            HyperConnection::http2(authority, io).await?
        } else {
            HyperConnection::http1(authority, io, options).await?
        };
        Ok(Box::new(conn))
    }
}

enum Sender {
    Http1(http1::SendRequest<Full<Bytes>>),
    Http2(http2::SendRequest<Full<Bytes>>),
}

/// One hyper client connection plus its driver task
pub struct HyperConnection {
    authority: Authority,
    sender: Sender,
    driver: JoinHandle<()>,
    closed: Arc<AtomicBool>,
}

impl HyperConnection {
    async fn http1<I>(
        authority: &Authority,
        io: I,
        options: &ConnectOptions,
    ) -> Result<Self, TransportError>
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let (sender, conn) = http1::Builder::new()
            .max_buf_size(options.max_buf_size.max(MIN_BUF_SIZE))
            .handshake(io)
            .await
            .map_err(|e| TransportError::Connect {
                authority: authority.to_string(),
                message: e.to_string(),
            })?;

        let closed = Arc::new(AtomicBool::new(false));
        let driver = spawn_driver(authority, Arc::clone(&closed), conn);
        Ok(Self {
            authority: authority.clone(),
            sender: Sender::Http1(sender),
            driver,
            closed,
        })
    }

    async fn http2<I>(authority: &Authority, io: I) -> Result<Self, TransportError>
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let (sender, conn) = http2::handshake(TokioExecutor::new(), io)
            .await
            .map_err(|e| TransportError::Connect {
                authority: authority.to_string(),
                message: e.to_string(),
            })?;

        let closed = Arc::new(AtomicBool::new(false));
        let driver = spawn_driver(authority, Arc::clone(&closed), conn);
        Ok(Self {
            authority: authority.clone(),
            sender: Sender::Http2(sender),
            driver,
            closed,
        })
    }

    /// Negotiated protocol version
    pub fn version(&self) -> Version {
        match self.sender {
            Sender::Http1(_) => Version::HTTP_11,
            Sender::Http2(_) => Version::HTTP_2,
        }
    }

    /// HTTP/1.1 wants origin-form targets, HTTP/2 needs scheme and authority
    fn request_target(&self, uri: &Uri) -> Result<Uri, TransportError> {
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let target = match self.sender {
            Sender::Http1(_) => path.to_string(),
            Sender::Http2(_) => format!(
                "{}://{}{}",
                self.authority.scheme(),
                self.authority.host_header(),
                path
            ),
        };
        target
            .parse::<Uri>()
            .map_err(|e| TransportError::Send(format!("invalid request target: {}", e)))
    }
}

fn spawn_driver<F>(authority: &Authority, closed: Arc<AtomicBool>, conn: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), hyper::Error>> + Send + 'static,
{
    let authority = authority.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!(authority = %authority, error = %e, "Connection error");
        }
        closed.store(true, Ordering::Release);
    })
}

/// Errors raised before the response head arrived count as send failures
fn classify(e: hyper::Error) -> TransportError {
    if e.is_user() || e.is_canceled() || e.is_body_write_aborted() || e.is_closed() {
        TransportError::Send(e.to_string())
    } else {
        TransportError::Receive(e.to_string())
    }
}

#[async_trait]
impl Connection for HyperConnection {
    fn is_open(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match &self.sender {
            Sender::Http1(s) => !s.is_closed(),
            Sender::Http2(s) => !s.is_closed(),
        }
    }

    async fn send(
        &mut self,
        request: Request<()>,
        body: Option<Bytes>,
    ) -> Result<ClientResponse, TransportError> {
        let (mut parts, ()) = request.into_parts();
        parts.uri = self.request_target(&parts.uri)?;
        parts.version = self.version();
        let request = Request::from_parts(parts, Full::new(body.unwrap_or_default()));

        let response = match &mut self.sender {
            Sender::Http1(sender) => {
                sender
                    .ready()
                    .await
                    .map_err(|e| TransportError::Send(e.to_string()))?;
                sender.send_request(request).await
            }
            Sender::Http2(sender) => {
                sender
                    .ready()
                    .await
                    .map_err(|e| TransportError::Send(e.to_string()))?;
                sender.send_request(request).await
            }
        }
        .map_err(classify)?;

        let (parts, incoming) = response.into_parts();
        let body = incoming
            .collect()
            .await
            .map_err(|e| TransportError::Receive(e.to_string()))?
            .to_bytes();

        Ok(ClientResponse {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            body,
        })
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        self.driver.abort();
        Ok(())
    }
}

impl Drop for HyperConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
