//! meshpool - pooled outbound HTTP client for service-to-service calls
//!
//! - Per-authority connection pools with borrow/restore tokens
//! - TLS trust contexts from PEM stores, with composite and default trust
//! - Client-credentials tokens and correlation headers on outgoing requests
//! - Circuit breaking per downstream authority

pub mod auth;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod pool;
pub mod resolve;
pub mod tls;
pub mod transport;

pub use crate::config::ClientConfig;
pub use crate::core::{Client, ClientBuilder};
pub use crate::error::ClientError;
