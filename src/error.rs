//! Errors surfaced to callers of the client

use crate::auth::AuthTokenError;
use crate::pool::{AuthorityError, CircuitError, PoolError};
use crate::resolve::ResolveError;
use crate::tls::TlsConfigError;
use crate::transport::TransportError;
use std::fmt;
use std::time::Duration;

/// Which bounded wait expired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    /// Waiting for a pooled connection, including connection establishment
    Borrow,

    /// Waiting for the response to be fully read
    Response,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutStage::Borrow => write!(f, "connection borrow"),
            TimeoutStage::Response => write!(f, "response"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("TLS configuration error: {0}")]
    Tls(#[from] TlsConfigError),

    #[error("Failed to connect to {authority}: {source}")]
    Connect {
        authority: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to send request to {authority}: {source}")]
    Send {
        authority: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to read response from {authority}: {source}")]
    Receive {
        authority: String,
        #[source]
        source: TransportError,
    },

    #[error("Timed out waiting for {stage} from {authority} after {elapsed:?}")]
    Timeout {
        authority: String,
        stage: TimeoutStage,
        elapsed: Duration,
    },

    #[error("Auth token error: {0}")]
    Auth(#[from] AuthTokenError),

    #[error("Circuit breaker is open for {0}")]
    CircuitOpen(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Service resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request was abandoned before it completed")]
    Abandoned,
}

impl ClientError {
    /// Attribute a transport failure to the phase it happened in
    pub fn from_transport(authority: &str, source: TransportError) -> Self {
        let authority = authority.to_string();
        match source {
            TransportError::Send(_) | TransportError::Closed => ClientError::Send { authority, source },
            TransportError::Receive(_) => ClientError::Receive { authority, source },
            _ => ClientError::Connect { authority, source },
        }
    }

    /// Whether the same request may succeed if sent again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. }
                | ClientError::Send { .. }
                | ClientError::Receive { .. }
                | ClientError::Timeout { .. }
        )
    }
}

impl From<PoolError> for ClientError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Timeout { authority, waited } => ClientError::Timeout {
                authority,
                stage: TimeoutStage::Borrow,
                elapsed: waited,
            },
            PoolError::Connect { authority, source } => ClientError::Connect { authority, source },
            PoolError::Tls(e) => ClientError::Tls(e),
            PoolError::NoPool(authority) => ClientError::Connect {
                authority,
                source: TransportError::Closed,
            },
            PoolError::ProtocolViolation(msg) => ClientError::ProtocolViolation(msg),
        }
    }
}

impl From<AuthorityError> for ClientError {
    fn from(e: AuthorityError) -> Self {
        ClientError::InvalidRequest(e.to_string())
    }
}

impl From<CircuitError<ClientError>> for ClientError {
    fn from(e: CircuitError<ClientError>) -> Self {
        match e {
            CircuitError::CircuitOpen(key) => ClientError::CircuitOpen(key),
            CircuitError::Inner(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_phase_mapping() {
        let err = ClientError::from_transport("http://a:80", TransportError::Send("reset".into()));
        assert!(matches!(err, ClientError::Send { .. }));

        let err = ClientError::from_transport("http://a:80", TransportError::Receive("eof".into()));
        assert!(matches!(err, ClientError::Receive { .. }));

        let err = ClientError::from_transport(
            "http://a:80",
            TransportError::Connect {
                authority: "http://a:80".into(),
                message: "refused".into(),
            },
        );
        assert!(matches!(err, ClientError::Connect { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_pool_timeout_is_borrow_stage() {
        let err: ClientError = PoolError::Timeout {
            authority: "http://a:80".into(),
            waited: Duration::from_millis(5),
        }
        .into();
        assert!(matches!(
            err,
            ClientError::Timeout {
                stage: TimeoutStage::Borrow,
                ..
            }
        ));
    }

    #[test]
    fn test_circuit_open_not_retryable() {
        let err: ClientError = CircuitError::<ClientError>::CircuitOpen("http://a:80".into()).into();
        assert!(matches!(err, ClientError::CircuitOpen(_)));
        assert!(!err.is_retryable());
    }
}
