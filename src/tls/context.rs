//! Trust context construction and caching

use super::store::{self, DefaultTrustLocator};
use super::verifier::{CompositeVerifier, NameInsensitiveVerifier, SourceVerifier};
use super::TlsConfigError;
use crate::config::TlsConfig;
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, SupportedProtocolVersion};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info, warn};

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
static TLS13_AND_12: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Protocol versions selected by `tlsVersion`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    /// `TLSv1.2`
    Tls12,

    /// `TLSv1.3`, falling back to 1.2
    Tls13,

    /// `TLS`: anything the provider supports
    Any,
}

impl TlsVersion {
    pub fn versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            TlsVersion::Tls12 => TLS12_ONLY,
            TlsVersion::Tls13 => TLS13_AND_12,
            TlsVersion::Any => rustls::ALL_VERSIONS,
        }
    }
}

impl FromStr for TlsVersion {
    type Err = TlsConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "TLSv1.2" => Ok(TlsVersion::Tls12),
            "TLSv1.3" => Ok(TlsVersion::Tls13),
            "TLS" => Ok(TlsVersion::Any),
            other => Err(TlsConfigError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Where a set of trust anchors came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustSource {
    Configured(PathBuf),
    PlatformDefault(PathBuf),
}

impl TrustSource {
    fn label(&self) -> String {
        match self {
            TrustSource::Configured(p) => format!("trustStore:{}", p.display()),
            TrustSource::PlatformDefault(p) => format!("default:{}", p.display()),
        }
    }

    fn path(&self) -> &Path {
        match self {
            TrustSource::Configured(p) | TrustSource::PlatformDefault(p) => p,
        }
    }
}

/// Immutable TLS settings shared by every secure connection
#[derive(Debug)]
pub struct TrustContext {
    config: Arc<ClientConfig>,
    verifier: Arc<dyn ServerCertVerifier>,
    sources: Vec<TrustSource>,
    client_certificate: bool,
    version: TlsVersion,
}

impl TrustContext {
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }

    /// The server certificate verifier installed in the client config
    pub fn verifier(&self) -> &Arc<dyn ServerCertVerifier> {
        &self.verifier
    }

    pub fn sources(&self) -> &[TrustSource] {
        &self.sources
    }

    /// Whether a client certificate is presented during handshakes
    pub fn has_client_certificate(&self) -> bool {
        self.client_certificate
    }

    pub fn version(&self) -> TlsVersion {
        self.version
    }
}

type ClientKey = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Builds a [`TrustContext`] from the `tls` configuration section
#[derive(Debug, Clone)]
pub struct TrustContextBuilder {
    locator: Option<DefaultTrustLocator>,
    alpn: Vec<Vec<u8>>,
    provider: Arc<CryptoProvider>,
}

impl TrustContextBuilder {
    pub fn new() -> Self {
        Self {
            locator: None,
            alpn: vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    /// Override how the platform default trust store is found
    pub fn with_default_locator(mut self, locator: DefaultTrustLocator) -> Self {
        self.locator = Some(locator);
        self
    }

    /// ALPN protocols offered, most preferred first
    pub fn with_alpn(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn = protocols;
        self
    }

    pub fn build(&self, config: &TlsConfig) -> Result<TrustContext, TlsConfigError> {
        let version = config.tls_version.parse::<TlsVersion>()?;
        let client_key = self.load_key_material(config)?;
        let sources = self.collect_sources(config)?;

        let mut verifiers = Vec::with_capacity(sources.len());
        for source in &sources {
            let key = match source {
                TrustSource::Configured(_) => "trustStore",
                TrustSource::PlatformDefault(_) => "defaultTrustStore",
            };
            let roots = store::load_roots(key, source.path())?;
            let webpki = WebPkiServerVerifier::builder_with_provider(
                Arc::new(roots),
                Arc::clone(&self.provider),
            )
            .build()
            .map_err(|e| TlsConfigError::Verifier(e.to_string()))?;

            let verifier: Arc<dyn ServerCertVerifier> = if config.verify_hostname {
                webpki
            } else {
                Arc::new(NameInsensitiveVerifier::new(webpki))
            };
            verifiers.push(SourceVerifier {
                label: source.label(),
                verifier,
            });
        }

        let verifier: Arc<dyn ServerCertVerifier> = match verifiers.len() {
            1 => Arc::clone(&verifiers[0].verifier),
            _ => Arc::new(CompositeVerifier::new(verifiers, Arc::clone(&self.provider))),
        };

        let builder = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(version.versions())?
            .dangerous()
            .with_custom_certificate_verifier(Arc::clone(&verifier));

        let client_certificate = client_key.is_some();
        let mut client_config = match client_key {
            Some((chain, key)) => builder.with_client_auth_cert(chain, key)?,
            None => builder.with_no_client_auth(),
        };
        client_config.alpn_protocols = self.alpn.clone();

        info!(
            sources = sources.len(),
            client_certificate,
            verify_hostname = config.verify_hostname,
            version = ?version,
            "Built TLS trust context"
        );

        Ok(TrustContext {
            config: Arc::new(client_config),
            verifier,
            sources,
            client_certificate,
            version,
        })
    }

    fn load_key_material(&self, config: &TlsConfig) -> Result<Option<ClientKey>, TlsConfigError> {
        if !config.load_key_store {
            return Ok(None);
        }
        let Some(path) = config.key_store.as_deref() else {
            error!(key = "keyStore", "Config property missing; no client certificate will be presented");
            return Ok(None);
        };
        if config.key_store_pass.is_none() {
            error!(key = "keyStorePass", "Config property missing; no client certificate will be presented");
            return Ok(None);
        }
        if config.key_pass.is_none() {
            warn!(key = "keyPass", "Config property missing; using the key store entry as is");
        }

        let path = Path::new(path);
        let chain = store::load_certs("keyStore", path)?;
        let key = store::load_private_key("keyStore", path)?;
        Ok(Some((chain, key)))
    }

    fn collect_sources(&self, config: &TlsConfig) -> Result<Vec<TrustSource>, TlsConfigError> {
        let mut sources = Vec::new();

        if config.load_trust_store {
            match (config.trust_store.as_deref(), config.trust_store_pass.as_deref()) {
                (Some(path), Some(_)) => sources.push(TrustSource::Configured(PathBuf::from(path))),
                (None, _) => {
                    error!(key = "trustStore", "Config property missing; configured trust store skipped")
                }
                (Some(_), None) => {
                    error!(key = "trustStorePass", "Config property missing; configured trust store skipped")
                }
            }
        }

        if config.load_default_trust_store {
            let locator = self
                .locator
                .clone()
                .unwrap_or_else(|| DefaultTrustLocator::from_config(config));
            match locator.locate() {
                Some(path) => sources.push(TrustSource::PlatformDefault(path)),
                None => warn!("Cannot locate the default trust store"),
            }
        }

        if sources.is_empty() {
            error!("No trust store is loaded. Please check client configuration");
            return Err(TlsConfigError::NoTrustMaterial);
        }
        Ok(sources)
    }
}

impl Default for TrustContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazily built, process-wide trust context.
///
/// Concurrent first callers wait on one build and observe the same instance.
/// Failed builds are not cached; the next caller retries.
#[derive(Debug)]
pub struct SharedTrustContext {
    builder: TrustContextBuilder,
    config: Mutex<TlsConfig>,
    slot: tokio::sync::Mutex<Option<Arc<TrustContext>>>,
}

impl SharedTrustContext {
    pub fn new(builder: TrustContextBuilder, config: TlsConfig) -> Self {
        Self {
            builder,
            config: Mutex::new(config),
            slot: tokio::sync::Mutex::new(None),
        }
    }

    /// The cached context, building it on first use
    pub async fn get(&self) -> Result<Arc<TrustContext>, TlsConfigError> {
        let mut slot = self.slot.lock().await;
        if let Some(ctx) = slot.as_ref() {
            return Ok(Arc::clone(ctx));
        }
        let ctx = Arc::new(self.builder.build(&self.config_snapshot())?);
        *slot = Some(Arc::clone(&ctx));
        Ok(ctx)
    }

    /// The cached context without building
    pub async fn current(&self) -> Option<Arc<TrustContext>> {
        self.slot.lock().await.clone()
    }

    /// Rebuild, optionally from new settings. The previous context stays in
    /// place when the rebuild fails.
    pub async fn reload(&self, config: Option<TlsConfig>) -> Result<Arc<TrustContext>, TlsConfigError> {
        let mut slot = self.slot.lock().await;
        let candidate = config.unwrap_or_else(|| self.config_snapshot());
        let ctx = Arc::new(self.builder.build(&candidate)?);
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = candidate;
        *slot = Some(Arc::clone(&ctx));
        info!("Reloaded TLS trust context");
        Ok(ctx)
    }

    fn config_snapshot(&self) -> TlsConfig {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{
        BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
        KeyUsagePurpose,
    };
    use rustls::pki_types::{ServerName, UnixTime};
    use std::io::Write;
    use tempfile::NamedTempFile;

    struct Minted {
        cert: rcgen::Certificate,
        key: KeyPair,
    }

    fn mint_ca(name: &str) -> Minted {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Minted { cert, key }
    }

    fn mint_leaf(ca: &Minted, host: &str) -> Minted {
        let mut params = CertificateParams::new(vec![host.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, host);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &ca.cert, &ca.key).unwrap();
        Minted { cert, key }
    }

    fn pem_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn verify(ctx: &TrustContext, leaf: &Minted, host: &str) -> Result<(), rustls::Error> {
        let name = ServerName::try_from(host.to_string()).unwrap();
        ctx.verifier()
            .verify_server_cert(leaf.cert.der(), &[], &name, &[], UnixTime::now())
            .map(|_| ())
    }

    fn base_config(trust_store: Option<&NamedTempFile>, default_store: Option<&NamedTempFile>) -> TlsConfig {
        TlsConfig {
            load_trust_store: trust_store.is_some(),
            trust_store: trust_store.map(|f| f.path().display().to_string()),
            trust_store_pass: Some("password".to_string()),
            load_default_trust_store: default_store.is_some(),
            default_trust_store: default_store.map(|f| f.path().display().to_string()),
            ..TlsConfig::default()
        }
    }

    #[test]
    fn test_composite_trust_accepts_either_source() {
        let ca1 = mint_ca("Mesh Internal CA");
        let ca2 = mint_ca("Public Root CA");
        let ca3 = mint_ca("Unknown CA");
        let store1 = pem_file(&ca1.cert.pem());
        let store2 = pem_file(&ca2.cert.pem());

        let ctx = TrustContextBuilder::new()
            .build(&base_config(Some(&store1), Some(&store2)))
            .unwrap();
        assert_eq!(ctx.sources().len(), 2);

        assert!(verify(&ctx, &mint_leaf(&ca1, "localhost"), "localhost").is_ok());
        assert!(verify(&ctx, &mint_leaf(&ca2, "localhost"), "localhost").is_ok());
        assert!(verify(&ctx, &mint_leaf(&ca3, "localhost"), "localhost").is_err());
    }

    #[test]
    fn test_configured_store_only() {
        let ca1 = mint_ca("Mesh Internal CA");
        let ca2 = mint_ca("Public Root CA");
        let store1 = pem_file(&ca1.cert.pem());

        let ctx = TrustContextBuilder::new()
            .build(&base_config(Some(&store1), None))
            .unwrap();

        assert!(verify(&ctx, &mint_leaf(&ca1, "localhost"), "localhost").is_ok());
        assert!(verify(&ctx, &mint_leaf(&ca2, "localhost"), "localhost").is_err());
    }

    #[test]
    fn test_no_trust_material() {
        let config = base_config(None, None);
        let err = TrustContextBuilder::new().build(&config).unwrap_err();
        assert!(matches!(err, TlsConfigError::NoTrustMaterial));
    }

    #[test]
    fn test_missing_trust_store_pass_skips_store() {
        let ca1 = mint_ca("Mesh Internal CA");
        let store1 = pem_file(&ca1.cert.pem());
        let mut config = base_config(Some(&store1), None);
        config.trust_store_pass = None;

        let err = TrustContextBuilder::new().build(&config).unwrap_err();
        assert!(matches!(err, TlsConfigError::NoTrustMaterial));
    }

    #[test]
    fn test_hostname_verification_toggle() {
        let ca1 = mint_ca("Mesh Internal CA");
        let store1 = pem_file(&ca1.cert.pem());
        let leaf = mint_leaf(&ca1, "localhost");

        let strict = TrustContextBuilder::new()
            .build(&base_config(Some(&store1), None))
            .unwrap();
        assert!(verify(&strict, &leaf, "other.example.com").is_err());

        let mut config = base_config(Some(&store1), None);
        config.verify_hostname = false;
        let relaxed = TrustContextBuilder::new().build(&config).unwrap();
        assert!(verify(&relaxed, &leaf, "other.example.com").is_ok());

        // Chain validation still applies
        let stranger = mint_leaf(&mint_ca("Unknown CA"), "localhost");
        assert!(verify(&relaxed, &stranger, "localhost").is_err());
    }

    #[test]
    fn test_tls_version_mapping() {
        assert_eq!("TLSv1.2".parse::<TlsVersion>().unwrap(), TlsVersion::Tls12);
        assert_eq!("TLSv1.3".parse::<TlsVersion>().unwrap().versions().len(), 2);
        assert_eq!("TLS".parse::<TlsVersion>().unwrap(), TlsVersion::Any);

        let ca1 = mint_ca("Mesh Internal CA");
        let store1 = pem_file(&ca1.cert.pem());
        let mut config = base_config(Some(&store1), None);
        config.tls_version = "SSLv3".to_string();
        let err = TrustContextBuilder::new().build(&config).unwrap_err();
        assert!(matches!(err, TlsConfigError::UnsupportedProtocol(_)));
        assert_eq!(err.key(), Some("tlsVersion"));
    }

    #[test]
    fn test_key_store_requires_password() {
        let ca1 = mint_ca("Mesh Internal CA");
        let store1 = pem_file(&ca1.cert.pem());
        let client = mint_leaf(&ca1, "client.mesh");
        let key_store = pem_file(&format!("{}{}", client.cert.pem(), client.key.serialize_pem()));

        let mut config = base_config(Some(&store1), None);
        config.load_key_store = true;
        config.key_store = Some(key_store.path().display().to_string());

        let ctx = TrustContextBuilder::new().build(&config).unwrap();
        assert!(!ctx.has_client_certificate());

        config.key_store_pass = Some("password".to_string());
        config.key_pass = Some("password".to_string());
        let ctx = TrustContextBuilder::new().build(&config).unwrap();
        assert!(ctx.has_client_certificate());
    }

    #[tokio::test]
    async fn test_shared_context_builds_once() {
        let ca1 = mint_ca("Mesh Internal CA");
        let store1 = pem_file(&ca1.cert.pem());
        let shared = Arc::new(SharedTrustContext::new(
            TrustContextBuilder::new(),
            base_config(Some(&store1), None),
        ));
        assert!(shared.current().await.is_none());

        let (a, b) = tokio::join!(shared.get(), shared.get());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));

        let reloaded = shared.reload(None).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &reloaded));
        assert!(Arc::ptr_eq(&reloaded, &shared.get().await.unwrap()));
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous() {
        let ca1 = mint_ca("Mesh Internal CA");
        let store1 = pem_file(&ca1.cert.pem());
        let shared = SharedTrustContext::new(
            TrustContextBuilder::new(),
            base_config(Some(&store1), None),
        );
        let first = shared.get().await.unwrap();

        assert!(shared.reload(Some(base_config(None, None))).await.is_err());
        assert!(Arc::ptr_eq(&first, &shared.get().await.unwrap()));
    }
}
