//! Connection pooling and circuit breaker module
//!
//! This module provides:
//! - Per-authority connection pools with exclusive borrow tokens
//! - Circuit breaker pattern for fault tolerance
//! - Authority parsing used as the pool key

pub mod authority;
pub mod circuit;
pub mod connection;

pub use authority::{Authority, AuthorityError};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, CircuitStats};
pub use connection::{
    ConnectionId, ConnectionPool, ConnectionToken, PoolConfig, PoolError, PoolSnapshot, PoolStats,
};
