//! PEM trust and key material loading

use super::TlsConfigError;
use crate::config::TlsConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable naming an explicit platform trust bundle
pub const DEFAULT_TRUST_STORE_ENV: &str = "SSL_CERT_FILE";

/// Well-known platform CA bundle locations, probed in order
pub const DEFAULT_TRUST_STORE_CANDIDATES: [&str; 2] = [
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
];

fn open(key: &'static str, path: &Path) -> Result<BufReader<File>, TlsConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsConfigError::Io {
            key,
            path: path.to_path_buf(),
            source,
        })
}

/// Read every certificate in a PEM file
pub fn load_certs(
    key: &'static str,
    path: &Path,
) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let mut reader = open(key, path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsConfigError::InvalidPem {
            key,
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(TlsConfigError::EmptyStore {
            key,
            path: path.to_path_buf(),
        });
    }
    Ok(certs)
}

/// Read the first private key in a PEM file
pub fn load_private_key(
    key: &'static str,
    path: &Path,
) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    let mut reader = open(key, path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsConfigError::InvalidPem {
            key,
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
        .ok_or_else(|| TlsConfigError::NoPrivateKey {
            key,
            path: path.to_path_buf(),
        })
}

/// Build a root store from a PEM bundle, skipping certificates rustls cannot parse
pub fn load_roots(key: &'static str, path: &Path) -> Result<RootCertStore, TlsConfigError> {
    let certs = load_certs(key, path)?;
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        warn!(path = %path.display(), ignored, "Skipped unparsable trust anchors");
    }
    if added == 0 {
        return Err(TlsConfigError::EmptyStore {
            key,
            path: path.to_path_buf(),
        });
    }
    debug!(path = %path.display(), anchors = added, "Loaded trust anchors");
    Ok(roots)
}

/// Finds the platform's default trust bundle
#[derive(Debug, Clone)]
pub struct DefaultTrustLocator {
    explicit: Option<PathBuf>,
    candidates: Vec<PathBuf>,
}

impl DefaultTrustLocator {
    /// Explicit location from config, then `SSL_CERT_FILE`, then well-known paths
    pub fn from_config(tls: &TlsConfig) -> Self {
        let explicit = tls
            .default_trust_store
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var(DEFAULT_TRUST_STORE_ENV)
                    .ok()
                    .filter(|s| !s.trim().is_empty())
                    .map(PathBuf::from)
            });

        Self {
            explicit,
            candidates: DEFAULT_TRUST_STORE_CANDIDATES
                .iter()
                .map(PathBuf::from)
                .collect(),
        }
    }

    pub fn new(explicit: Option<PathBuf>, candidates: Vec<PathBuf>) -> Self {
        Self {
            explicit,
            candidates,
        }
    }

    /// Locate the bundle. An explicit location that does not exist is not
    /// substituted with a well-known path.
    pub fn locate(&self) -> Option<PathBuf> {
        if let Some(path) = &self.explicit {
            if path.is_file() {
                return Some(path.clone());
            }
            warn!(path = %path.display(), "Configured default trust store does not exist");
            return None;
        }
        self.candidates.iter().find(|p| p.is_file()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_locator_prefers_explicit() {
        let file = NamedTempFile::new().unwrap();
        let locator = DefaultTrustLocator::new(
            Some(file.path().to_path_buf()),
            vec![PathBuf::from("/definitely/not/here.pem")],
        );
        assert_eq!(locator.locate(), Some(file.path().to_path_buf()));
    }

    #[test]
    fn test_locator_missing_explicit_is_none() {
        let fallback = NamedTempFile::new().unwrap();
        let locator = DefaultTrustLocator::new(
            Some(PathBuf::from("/definitely/not/here.pem")),
            vec![fallback.path().to_path_buf()],
        );
        assert_eq!(locator.locate(), None);
    }

    #[test]
    fn test_locator_probes_candidates() {
        let found = NamedTempFile::new().unwrap();
        let locator = DefaultTrustLocator::new(
            None,
            vec![
                PathBuf::from("/definitely/not/here.pem"),
                found.path().to_path_buf(),
            ],
        );
        assert_eq!(locator.locate(), Some(found.path().to_path_buf()));
    }

    #[test]
    fn test_empty_pem_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let err = load_roots("trustStore", file.path()).unwrap_err();
        assert!(matches!(err, TlsConfigError::EmptyStore { key: "trustStore", .. }));
    }

    #[test]
    fn test_missing_file_names_key() {
        let err = load_certs("keyStore", Path::new("/definitely/not/here.pem")).unwrap_err();
        assert!(err.to_string().contains("keyStore"));
    }
}
