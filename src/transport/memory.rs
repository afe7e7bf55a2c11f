//! In-process transport
//!
//! Requests are answered by a handler closure instead of a socket. Useful for
//! exercising pool, dispatcher and breaker behavior without a network.

use super::{ClientResponse, ConnectOptions, Connection, Transport, TransportError};
use crate::pool::Authority;
use crate::tls::TrustContext;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::{Request, StatusCode};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Answers one request
pub type Handler =
    Arc<dyn Fn(&Request<()>, Option<&Bytes>) -> Result<ClientResponse, TransportError> + Send + Sync>;

struct Shared {
    handler: Handler,
    latency_ms: AtomicU64,
    connect_delay_ms: AtomicU64,
    fail_connect: AtomicBool,
    connects: AtomicUsize,
    sends: AtomicUsize,
    live: Mutex<Vec<Arc<AtomicBool>>>,
}

/// Transport whose connections call a handler in-process
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Request<()>, Option<&Bytes>) -> Result<ClientResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                handler: Arc::new(handler),
                latency_ms: AtomicU64::new(0),
                connect_delay_ms: AtomicU64::new(0),
                fail_connect: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                sends: AtomicUsize::new(0),
                live: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Every request gets `200 ok`
    pub fn ok() -> Self {
        Self::new(|_, _| Ok(ClientResponse::new(StatusCode::OK, "ok")))
    }

    /// Delay applied before each response
    pub fn set_latency(&self, latency: Duration) {
        self.shared
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Delay applied before each connect completes
    pub fn set_connect_delay(&self, delay: Duration) {
        self.shared
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Make subsequent connects fail
    pub fn set_fail_connect(&self, fail: bool) {
        self.shared.fail_connect.store(fail, Ordering::Relaxed);
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::Relaxed)
    }

    pub fn send_count(&self) -> usize {
        self.shared.sends.load(Ordering::Relaxed)
    }

    /// Close every connection opened so far, as a server shutdown would
    pub fn close_all(&self) {
        let live = self.shared.live.lock().unwrap_or_else(PoisonError::into_inner);
        for open in live.iter() {
            open.store(false, Ordering::Release);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        authority: &Authority,
        _tls: Option<&TrustContext>,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let delay = self.shared.connect_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.shared.fail_connect.load(Ordering::Relaxed) {
            return Err(TransportError::Connect {
                authority: authority.to_string(),
                message: "connection refused".to_string(),
            });
        }

        self.shared.connects.fetch_add(1, Ordering::Relaxed);
        let open = Arc::new(AtomicBool::new(true));
        self.shared
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&open));

        Ok(Box::new(MemoryConnection {
            open,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MemoryConnection {
    open: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send(
        &mut self,
        request: Request<()>,
        body: Option<Bytes>,
    ) -> Result<ClientResponse, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.shared.sends.fetch_add(1, Ordering::Relaxed);

        let latency = self.shared.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        (self.shared.handler)(&request, body.as_ref())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.open.store(false, Ordering::Release);
    }
}
