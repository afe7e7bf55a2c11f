//! TLS trust for outbound connections
//!
//! This module turns the `tls` configuration section into a rustls client
//! configuration:
//! - Configured trust store plus the platform default store, combined so a
//!   server is trusted when either source accepts its chain
//! - Optional client certificate from the key store
//! - Hostname verification that can be switched off without disabling chain
//!   validation
//! - Protocol version selection from `tlsVersion`
//!
//! Certificate material is read as PEM.

pub mod context;
pub mod store;
pub mod verifier;

pub use context::{SharedTrustContext, TlsVersion, TrustContext, TrustContextBuilder, TrustSource};
pub use store::DefaultTrustLocator;
pub use verifier::{CompositeVerifier, NameInsensitiveVerifier};

use std::path::PathBuf;

/// Errors building a trust context. Each names the configuration key at fault.
#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("Cannot read {key} at {path}: {source}")]
    Io {
        key: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid PEM in {key} at {path}: {message}")]
    InvalidPem {
        key: &'static str,
        path: PathBuf,
        message: String,
    },

    #[error("No certificates found in {key} at {path}")]
    EmptyStore { key: &'static str, path: PathBuf },

    #[error("No private key found in {key} at {path}")]
    NoPrivateKey { key: &'static str, path: PathBuf },

    #[error("No trust store is loaded. Please check client configuration")]
    NoTrustMaterial,

    #[error("Unsupported tlsVersion: {0}")]
    UnsupportedProtocol(String),

    #[error("Failed to build certificate verifier: {0}")]
    Verifier(String),

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),
}

impl TlsConfigError {
    /// Configuration key the error refers to, when there is one
    pub fn key(&self) -> Option<&'static str> {
        match self {
            TlsConfigError::Io { key, .. }
            | TlsConfigError::InvalidPem { key, .. }
            | TlsConfigError::EmptyStore { key, .. }
            | TlsConfigError::NoPrivateKey { key, .. } => Some(*key),
            TlsConfigError::UnsupportedProtocol(_) => Some("tlsVersion"),
            TlsConfigError::NoTrustMaterial => Some("loadTrustStore"),
            _ => None,
        }
    }
}
