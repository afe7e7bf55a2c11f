//! Request dispatch over pooled connections
//!
//! Each exchange runs on its own task:
//! - A connection is taken from the pool (idle first, new if needed)
//! - The request is sent and the response read in full
//! - Borrowing and the response read share one deadline, the request timeout
//! - The connection is restored after a clean exchange and discarded after
//!   any failure
//!
//! The caller receives a [`ResponseFuture`] that resolves exactly once.

use crate::error::{ClientError, TimeoutStage};
use crate::pool::{Authority, ConnectionPool, ConnectionToken, PoolError};
use crate::transport::ClientResponse;
use bytes::Bytes;
use hyper::header::{HeaderValue, HOST};
use hyper::Request;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

type Outcome = Result<ClientResponse, ClientError>;

/// Producer side of a single-assignment result slot.
///
/// The first call to [`Completion::complete`] decides the outcome; later
/// calls are ignored.
#[derive(Clone)]
pub struct Completion {
    slot: Arc<Mutex<Option<oneshot::Sender<Outcome>>>>,
}

impl Completion {
    pub fn new() -> (Self, ResponseFuture) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            ResponseFuture { rx },
        )
    }

    /// Resolve the paired future. Returns false when it was already resolved.
    pub fn complete(&self, outcome: Outcome) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                // The caller may have stopped waiting; the outcome is still final
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Resolves to the response, or the first failure of the exchange
#[must_use = "futures do nothing unless polled"]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Outcome>,
}

impl Future for ResponseFuture {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ClientError::Abandoned)))
    }
}

/// Sends requests over connections borrowed from a [`ConnectionPool`]
#[derive(Clone)]
pub struct RequestDispatcher {
    pool: Arc<ConnectionPool>,
    timeout: Duration,
}

impl RequestDispatcher {
    /// `timeout` is one deadline covering the connection borrow and the
    /// response read together
    pub fn new(pool: Arc<ConnectionPool>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a request to `authority` and wait for the full response
    pub async fn call(
        &self,
        authority: &Authority,
        request: Request<()>,
        body: Option<Bytes>,
    ) -> Result<ClientResponse, ClientError> {
        self.dispatch(authority.clone(), request, body).await
    }

    /// Start an exchange on a background task.
    ///
    /// Dropping the returned future does not cancel the exchange; the
    /// connection is still restored or discarded when it finishes.
    pub fn dispatch(
        &self,
        authority: Authority,
        mut request: Request<()>,
        body: Option<Bytes>,
    ) -> ResponseFuture {
        let (completion, future) = Completion::new();

        if let Err(e) = set_host_header(&mut request, &authority) {
            completion.complete(Err(e));
            return future;
        }

        let dispatcher = self.clone();
        tokio::spawn(async move {
            let outcome = dispatcher.exchange(&authority, request, body).await;
            if let Err(e) = &outcome {
                debug!(authority = %authority, error = %e, "Exchange failed");
            }
            completion.complete(outcome);
        });
        future
    }

    async fn exchange(
        &self,
        authority: &Authority,
        request: Request<()>,
        body: Option<Bytes>,
    ) -> Result<ClientResponse, ClientError> {
        if authority.is_secure() {
            self.pool.trust().get().await?;
        }

        let started = Instant::now();
        let deadline = started + self.timeout;

        let mut token = self.obtain(authority, deadline).await?;
        debug!(
            authority = %authority,
            connection = %token.id(),
            method = %request.method(),
            path = request.uri().path(),
            "Sending request"
        );

        let sent = tokio::time::timeout_at(deadline, token.connection().send(request, body)).await;
        match sent {
            Ok(Ok(response)) => {
                if let Err(e) = self.pool.restore(token) {
                    warn!(authority = %authority, error = %e, "Failed to restore connection");
                }
                Ok(response)
            }
            Ok(Err(e)) => {
                self.release_failed(token);
                Err(ClientError::from_transport(&authority.to_string(), e))
            }
            Err(_) => {
                self.release_failed(token);
                Err(ClientError::Timeout {
                    authority: authority.to_string(),
                    stage: TimeoutStage::Response,
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    /// Reuse an idle connection when there is one, otherwise borrow
    async fn obtain(
        &self,
        authority: &Authority,
        deadline: Instant,
    ) -> Result<ConnectionToken, ClientError> {
        match self.pool.try_reuse(authority) {
            Ok(Some(token)) => return Ok(token),
            Ok(None) | Err(PoolError::NoPool(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        Ok(self.pool.borrow(authority, remaining).await?)
    }

    fn release_failed(&self, token: ConnectionToken) {
        if let Err(e) = self.pool.discard(token) {
            warn!(error = %e, "Failed to discard connection");
        }
    }
}

/// Fill in `Host` from the destination authority when the caller left it out
fn set_host_header(request: &mut Request<()>, authority: &Authority) -> Result<(), ClientError> {
    if request.headers().contains_key(HOST) {
        return Ok(());
    }
    let value = HeaderValue::from_str(&authority.host_header())
        .map_err(|e| ClientError::InvalidRequest(format!("invalid host {}: {}", authority, e)))?;
    request.headers_mut().insert(HOST, value);
    Ok(())
}
