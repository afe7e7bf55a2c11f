//! Client configuration
//!
//! Mirrors the `client.yml` layout used by services in the mesh:
//! - `tls`: trust store, key store and protocol settings
//! - `request`: pool sizing, timeouts and header injection switches
//! - `oauth.token`: client-credentials grant settings
//! - `services` / `pathPrefixService`: static cluster resolution

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// TLS trust and key material configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// Verify that the server certificate matches the host name
    #[serde(default = "default_true")]
    pub verify_hostname: bool,

    /// Load a client key store for mutual TLS
    #[serde(default)]
    pub load_key_store: bool,

    /// Load the configured trust store
    #[serde(default)]
    pub load_trust_store: bool,

    /// Also load the platform default trust store
    #[serde(default)]
    pub load_default_trust_store: bool,

    /// PEM bundle of trusted CA certificates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_store: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_store_pass: Option<String>,

    /// PEM file holding the client certificate chain and private key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_store: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_store_pass: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_pass: Option<String>,

    /// Password of the platform default trust store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_cert_password: Option<String>,

    /// Explicit location of the platform default trust store.
    /// Falls back to `SSL_CERT_FILE`, then well-known system bundles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_trust_store: Option<String>,

    /// TLS protocol version: TLSv1.2, TLSv1.3 or TLS
    #[serde(default = "default_tls_version")]
    pub tls_version: String,
}

fn default_true() -> bool {
    true
}

fn default_tls_version() -> String {
    "TLSv1.2".to_string()
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verify_hostname: true,
            load_key_store: false,
            load_trust_store: false,
            load_default_trust_store: false,
            trust_store: None,
            trust_store_pass: None,
            key_store: None,
            key_store_pass: None,
            key_pass: None,
            default_cert_password: None,
            default_trust_store: None,
            tls_version: default_tls_version(),
        }
    }
}

/// Request, pool and resilience settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestConfig {
    /// Read buffer size in KB
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Idle connection time-to-live in milliseconds
    #[serde(default = "default_connection_expire_time")]
    pub connection_expire_time: u64,

    /// Maximum connections per authority
    #[serde(default = "default_connection_pool_size")]
    pub connection_pool_size: usize,

    /// Borrow and request timeout in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    #[serde(default)]
    pub inject_open_tracing: bool,

    #[serde(default)]
    pub inject_caller_id: bool,

    /// Forward the caller's JWT claims as a `jwtClaims` header
    #[serde(default)]
    pub forward_jwt_claims: bool,

    /// Offer h2 through ALPN on secure connections
    #[serde(default = "default_true")]
    pub enable_http2: bool,

    /// Consecutive failures before the circuit opens
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    /// Circuit cool-down in milliseconds
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout: u64,

    /// Failure ratio within the rolling window that opens the circuit
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    /// Samples required before the failure ratio is considered
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: u32,

    /// Rolling window length in milliseconds
    #[serde(default = "default_rolling_window")]
    pub rolling_window: u64,
}

fn default_buffer_size() -> usize {
    24
}

fn default_connection_expire_time() -> u64 {
    1_800_000
}

fn default_connection_pool_size() -> usize {
    1000
}

fn default_timeout() -> u64 {
    3000
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_error_threshold() -> u32 {
    5
}

fn default_reset_timeout() -> u64 {
    7000
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_minimum_calls() -> u32 {
    10
}

fn default_rolling_window() -> u64 {
    60_000
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            connection_expire_time: default_connection_expire_time(),
            connection_pool_size: default_connection_pool_size(),
            timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
            inject_open_tracing: false,
            inject_caller_id: false,
            forward_jwt_claims: false,
            enable_http2: true,
            error_threshold: default_error_threshold(),
            reset_timeout: default_reset_timeout(),
            failure_rate_threshold: default_failure_rate_threshold(),
            minimum_calls: default_minimum_calls(),
            rolling_window: default_rolling_window(),
        }
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    pub fn connection_expire_time(&self) -> Duration {
        Duration::from_millis(self.connection_expire_time)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout)
    }

    pub fn rolling_window(&self) -> Duration {
        Duration::from_millis(self.rolling_window)
    }

    /// Buffer size in bytes
    pub fn buffer_bytes(&self) -> usize {
        self.buffer_size * 1024
    }
}

/// OAuth2 client-credentials grant settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenConfig {
    /// Authorization server base URL (e.g. https://oauth.example.com:6882)
    pub server_url: String,

    #[serde(default = "default_token_path")]
    pub token_path: String,

    pub client_id: String,

    pub client_secret: String,

    #[serde(default)]
    pub scope: Vec<String>,

    /// Renew a cached token this many milliseconds before it expires
    #[serde(default = "default_token_renew_before_expired")]
    pub token_renew_before_expired: u64,
}

fn default_token_path() -> String {
    "/oauth2/token".to_string()
}

fn default_token_renew_before_expired() -> u64 {
    60_000
}

impl TokenConfig {
    pub fn renew_before_expired(&self) -> Duration {
        Duration::from_millis(self.token_renew_before_expired)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenConfig>,
}

/// Path prefix to service id mapping.
///
/// Accepts a YAML map, a JSON object string, or `prefix=serviceId&...`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrefixMapping {
    Map(HashMap<String, String>),
    Text(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub request: RequestConfig,

    #[serde(default)]
    pub oauth: OAuthConfig,

    /// Identity of the local service, sent as the caller id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,

    /// Static cluster: serviceId (or `serviceId|envTag`) to URLs
    #[serde(default)]
    pub services: HashMap<String, Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_prefix_service: Option<PrefixMapping>,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<ClientConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: ClientConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Apply `MESHPOOL_*` environment overrides on top of `config`
///
/// - MESHPOOL_SERVICE_ID
/// - MESHPOOL_TIMEOUT (ms)
/// - MESHPOOL_POOL_SIZE
/// - MESHPOOL_EXPIRE_TIME (ms)
/// - MESHPOOL_TRUST_STORE / MESHPOOL_TRUST_STORE_PASS
/// - MESHPOOL_KEY_STORE_PASS / MESHPOOL_KEY_PASS
/// - MESHPOOL_VERIFY_HOSTNAME (true/false)
pub fn apply_env(config: &mut ClientConfig) {
    if let Ok(service_id) = std::env::var("MESHPOOL_SERVICE_ID") {
        config.service_id = Some(service_id);
    }

    if let Ok(timeout) = std::env::var("MESHPOOL_TIMEOUT") {
        if let Ok(val) = timeout.parse() {
            config.request.timeout = val;
        }
    }

    if let Ok(size) = std::env::var("MESHPOOL_POOL_SIZE") {
        if let Ok(val) = size.parse() {
            config.request.connection_pool_size = val;
        }
    }

    if let Ok(expire) = std::env::var("MESHPOOL_EXPIRE_TIME") {
        if let Ok(val) = expire.parse() {
            config.request.connection_expire_time = val;
        }
    }

    if let Ok(trust_store) = std::env::var("MESHPOOL_TRUST_STORE") {
        config.tls.trust_store = Some(trust_store);
        config.tls.load_trust_store = true;
    }

    // Secrets are commonly injected through the environment rather than the file
    if let Ok(pass) = std::env::var("MESHPOOL_TRUST_STORE_PASS") {
        config.tls.trust_store_pass = Some(pass);
    }
    if let Ok(pass) = std::env::var("MESHPOOL_KEY_STORE_PASS") {
        config.tls.key_store_pass = Some(pass);
    }
    if let Ok(pass) = std::env::var("MESHPOOL_KEY_PASS") {
        config.tls.key_pass = Some(pass);
    }

    if let Ok(verify) = std::env::var("MESHPOOL_VERIFY_HOSTNAME") {
        config.tls.verify_hostname = !matches!(verify.as_str(), "false" | "0");
    }
}

/// Load configuration from environment variables only
pub fn load_from_env() -> Result<ClientConfig> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = ClientConfig::new();
    apply_env(&mut config);
    Ok(config)
}

/// Load configuration from file or environment
///
/// With a path, the YAML file is loaded and environment overrides applied on
/// top. Without one, defaults plus environment overrides are used.
pub fn load_config(config_path: Option<&str>) -> Result<ClientConfig> {
    match config_path {
        Some(path) => {
            let _ = dotenvy::dotenv();
            let mut config = load_from_yaml(path)?;
            apply_env(&mut config);
            Ok(config)
        }
        None => load_from_env(),
    }
}
