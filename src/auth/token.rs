//! Client-credentials tokens: sources and a single-flight cache

use super::claims;
use crate::config::TokenConfig;
use crate::dispatch::RequestDispatcher;
use crate::pool::Authority;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use dashmap::DashMap;
use hyper::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Request, Uri};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AuthTokenError {
    #[error("OAuth token configuration error: {0}")]
    Config(String),

    #[error("Token request failed: {0}")]
    Exchange(String),

    #[error("Token endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    #[error("Token is not a valid header value")]
    InvalidHeader,
}

/// A token plus when it stops being usable
#[derive(Debug, Clone)]
pub struct CachedToken {
    token: String,
    expires_at: Option<Instant>,
    scope: Vec<String>,
}

impl CachedToken {
    /// `ttl` of `None` means the token never expires
    pub fn new(token: impl Into<String>, ttl: Option<Duration>, scope: Vec<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
            scope,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.expires_within(Duration::ZERO)
    }

    /// Whether the token expires within `margin` from now
    pub fn expires_within(&self, margin: Duration) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() + margin >= at,
            None => false,
        }
    }
}

/// Identity a token is requested for
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub scope: Vec<String>,
}

impl ClientCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>, scope: Vec<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope,
        }
    }

    pub fn from_config(config: &TokenConfig) -> Self {
        Self::new(
            config.client_id.clone(),
            config.client_secret.clone(),
            config.scope.clone(),
        )
    }

    /// Cache key: client id plus the sorted scope set
    pub fn cache_key(&self) -> String {
        let mut scope = self.scope.clone();
        scope.sort();
        scope.dedup();
        format!("{}|{}", self.client_id, scope.join(" "))
    }
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .field("scope", &self.scope)
            .finish()
    }
}

/// Issues tokens for a set of client credentials
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self, credentials: &ClientCredentials) -> Result<CachedToken, AuthTokenError>;
}

/// Hands out a fixed token
pub struct StaticTokenSource {
    token: String,
    ttl: Option<Duration>,
    fetches: AtomicUsize,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            token: token.into(),
            ttl,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch(&self, credentials: &ClientCredentials) -> Result<CachedToken, AuthTokenError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        Ok(CachedToken::new(
            self.token.clone(),
            self.ttl,
            credentials.scope.clone(),
        ))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,

    #[serde(default)]
    expires_in: Option<u64>,

    #[serde(default)]
    scope: Option<String>,
}

/// Form-encode parameters; spaces become `%20`
pub fn form_data_string(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Client-credentials grant against an OAuth2 token endpoint
pub struct OAuth2TokenSource {
    token_uri: Uri,
    authority: Authority,
    dispatcher: RequestDispatcher,
}

impl OAuth2TokenSource {
    pub fn new(config: &TokenConfig, dispatcher: RequestDispatcher) -> Result<Self, AuthTokenError> {
        let url = format!(
            "{}{}",
            config.server_url.trim_end_matches('/'),
            config.token_path
        );
        let token_uri = url
            .parse::<Uri>()
            .map_err(|e| AuthTokenError::Config(format!("serverUrl {}: {}", url, e)))?;
        let authority = Authority::from_uri(&token_uri)
            .map_err(|e| AuthTokenError::Config(format!("serverUrl: {}", e)))?;
        Ok(Self {
            token_uri,
            authority,
            dispatcher,
        })
    }

    pub fn token_uri(&self) -> &Uri {
        &self.token_uri
    }
}

#[async_trait]
impl TokenSource for OAuth2TokenSource {
    async fn fetch(&self, credentials: &ClientCredentials) -> Result<CachedToken, AuthTokenError> {
        let scope = credentials.scope.join(" ");
        let mut params = vec![("grant_type", "client_credentials")];
        if !scope.is_empty() {
            params.push(("scope", scope.as_str()));
        }
        let body = form_data_string(&params);

        let basic = STANDARD.encode(format!(
            "{}:{}",
            credentials.client_id, credentials.client_secret
        ));
        let request = Request::post(self.token_uri.clone())
            .header(AUTHORIZATION, format!("Basic {}", basic))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(ACCEPT, "application/json")
            .body(())
            .map_err(|e| AuthTokenError::Exchange(e.to_string()))?;

        debug!(token_uri = %self.token_uri, client_id = %credentials.client_id, "Requesting client credentials token");
        let response = self
            .dispatcher
            .call(&self.authority, request, Some(Bytes::from(body)))
            .await
            .map_err(|e| AuthTokenError::Exchange(e.to_string()))?;

        if !response.status.is_success() {
            return Err(AuthTokenError::Rejected {
                status: response.status.as_u16(),
                body: response.body_text().into_owned(),
            });
        }

        let parsed: TokenResponse = serde_json::from_slice(&response.body)
            .map_err(|e| AuthTokenError::InvalidResponse(e.to_string()))?;
        if parsed.access_token.is_empty() {
            return Err(AuthTokenError::InvalidResponse("empty access_token".to_string()));
        }

        let ttl = parsed.expires_in.map(Duration::from_secs).or_else(|| {
            claims::extract_claims(&parsed.access_token)
                .ok()
                .and_then(|c| claims::expires_in(&c))
        });
        let scope = parsed
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|| credentials.scope.clone());

        info!(client_id = %credentials.client_id, ttl = ?ttl, "Obtained client credentials token");
        Ok(CachedToken::new(parsed.access_token, ttl, scope))
    }
}

/// Caches tokens per credential key and refreshes them one caller at a time
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    renew_before: Duration,
    entries: DashMap<String, Arc<tokio::sync::Mutex<Option<CachedToken>>>>,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>, renew_before: Duration) -> Self {
        Self {
            source,
            renew_before,
            entries: DashMap::new(),
        }
    }

    fn slot(&self, key: &str) -> Arc<tokio::sync::Mutex<Option<CachedToken>>> {
        if let Some(slot) = self.entries.get(key) {
            return Arc::clone(slot.value());
        }
        Arc::clone(self.entries.entry(key.to_string()).or_default().value())
    }

    /// A token valid for at least the renewal margin, fetching one if needed.
    ///
    /// Concurrent callers for the same credentials share one fetch. When an
    /// early renewal fails, the cached token is returned for as long as it
    /// has not actually expired.
    pub async fn get_token(&self, credentials: &ClientCredentials) -> Result<CachedToken, AuthTokenError> {
        let key = credentials.cache_key();
        let slot = self.slot(&key);
        let mut cached = slot.lock().await;

        if let Some(token) = cached.as_ref() {
            if !token.expires_within(self.renew_before) {
                return Ok(token.clone());
            }
            debug!(client_id = %credentials.client_id, "Cached token is about to expire; renewing");
        }

        match self.source.fetch(credentials).await {
            Ok(token) => {
                *cached = Some(token.clone());
                Ok(token)
            }
            Err(e) => match cached.as_ref().filter(|token| !token.is_expired()) {
                Some(token) => {
                    warn!(
                        client_id = %credentials.client_id,
                        error = %e,
                        "Token renewal failed; using the cached token until it expires"
                    );
                    Ok(token.clone())
                }
                None => {
                    warn!(client_id = %credentials.client_id, error = %e, "Failed to obtain token");
                    Err(e)
                }
            },
        }
    }

    /// Forget the cached token so the next caller fetches a fresh one
    pub async fn invalidate(&self, credentials: &ClientCredentials) {
        let slot = self.slot(&credentials.cache_key());
        *slot.lock().await = None;
    }
}
