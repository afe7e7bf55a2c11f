//! Decoration of outgoing requests with identity and correlation headers

use super::claims;
use super::token::{AuthTokenError, ClientCredentials, TokenCache};
use super::trace::Tracer;
use crate::config::ClientConfig;
use hyper::header::{HeaderName, HeaderValue, AUTHORIZATION};
use hyper::{HeaderMap, Request};
use std::sync::Arc;
use tracing::{debug, warn};

pub const CORRELATION_ID: HeaderName = HeaderName::from_static("x-correlation-id");
pub const TRACEABILITY_ID: HeaderName = HeaderName::from_static("x-traceability-id");
pub const SCOPE_TOKEN: HeaderName = HeaderName::from_static("x-scope-token");
pub const CALLER_ID: HeaderName = HeaderName::from_static("x-caller-id");
pub const JWT_CLAIMS: HeaderName = HeaderName::from_static("jwtclaims");

/// What we know about the inbound request being served, if any
#[derive(Clone, Default)]
pub struct RequestContext {
    /// Caller's `Authorization` value
    pub authorization: Option<String>,
    pub correlation_id: Option<String>,
    pub traceability_id: Option<String>,
    pub tracer: Option<Arc<dyn Tracer>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick up caller identity and correlation headers from an inbound request
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            authorization: get(&AUTHORIZATION),
            correlation_id: get(&CORRELATION_ID),
            traceability_id: get(&TRACEABILITY_ID),
            tracer: None,
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }
}

/// Normalize to a `Bearer ` prefix, accepting any casing on input
pub fn normalize_bearer(token: &str) -> String {
    format!("Bearer {}", claims::strip_bearer(token))
}

/// Set `Authorization` to the bearer form of `token`
pub fn add_auth_token(headers: &mut HeaderMap, token: &str) -> Result<(), AuthTokenError> {
    headers.insert(AUTHORIZATION, header_value(&normalize_bearer(token))?);
    Ok(())
}

fn header_value(value: &str) -> Result<HeaderValue, AuthTokenError> {
    HeaderValue::from_str(value).map_err(|_| AuthTokenError::InvalidHeader)
}

/// Injector switches, taken from the `request` section
#[derive(Debug, Clone, Default)]
pub struct InjectorSettings {
    pub inject_open_tracing: bool,
    pub inject_caller_id: bool,
    pub forward_jwt_claims: bool,
    pub caller_id: Option<String>,
}

impl InjectorSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            inject_open_tracing: config.request.inject_open_tracing,
            inject_caller_id: config.request.inject_caller_id,
            forward_jwt_claims: config.request.forward_jwt_claims,
            caller_id: config.service_id.clone(),
        }
    }
}

/// Attaches the client-credentials token and propagation headers
pub struct AuthHeaderInjector {
    cache: Arc<TokenCache>,
    credentials: ClientCredentials,
    settings: InjectorSettings,
}

impl AuthHeaderInjector {
    pub fn new(cache: Arc<TokenCache>, credentials: ClientCredentials, settings: InjectorSettings) -> Self {
        Self {
            cache,
            credentials,
            settings,
        }
    }

    pub fn cache(&self) -> &Arc<TokenCache> {
        &self.cache
    }

    pub fn credentials(&self) -> &ClientCredentials {
        &self.credentials
    }

    /// Add auth, correlation and tracing headers to `request`.
    ///
    /// Without a caller token the cached client token becomes the
    /// `Authorization` header. With one, the caller token is kept and the
    /// client token travels as `X-Scope-Token`.
    pub async fn decorate(
        &self,
        mut request: Request<()>,
        context: &RequestContext,
    ) -> Result<Request<()>, AuthTokenError> {
        let cached = self.cache.get_token(&self.credentials).await?;
        let client_token = normalize_bearer(cached.token());

        let caller_token = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| context.authorization.clone())
            .filter(|t| !claims::strip_bearer(t).is_empty());

        let method = request.method().to_string();
        let url = request.uri().to_string();
        let headers = request.headers_mut();

        match &caller_token {
            Some(caller) => {
                add_auth_token(headers, caller)?;
                headers.insert(SCOPE_TOKEN, header_value(&client_token)?);
                if self.settings.forward_jwt_claims {
                    forward_claims(headers, caller);
                }
            }
            None => {
                headers.insert(AUTHORIZATION, header_value(&client_token)?);
            }
        }

        if let Some(cid) = &context.correlation_id {
            headers.insert(CORRELATION_ID, header_value(cid)?);
        }
        if let Some(tid) = &context.traceability_id {
            headers.insert(TRACEABILITY_ID, header_value(tid)?);
        }

        if let (true, Some(tracer)) = (self.settings.inject_open_tracing, &context.tracer) {
            if let Some(span) = tracer.active_span() {
                span.set_tag("span.kind", "client");
                span.set_tag("http.method", &method);
                span.set_tag("http.url", &url);
                tracer.inject(&span.context(), headers);
            }
        }

        if self.settings.inject_caller_id {
            if let Some(caller_id) = &self.settings.caller_id {
                headers.insert(CALLER_ID, header_value(caller_id)?);
            }
        }

        debug!(
            scope_token = caller_token.is_some(),
            correlation_id = ?context.correlation_id,
            "Decorated outgoing request"
        );
        Ok(request)
    }
}

fn forward_claims(headers: &mut HeaderMap, token: &str) {
    match claims::extract_claims(token) {
        Ok(claims) => {
            let json = serde_json::Value::Object(claims).to_string();
            match HeaderValue::from_str(&json) {
                Ok(value) => {
                    headers.insert(JWT_CLAIMS, value);
                }
                Err(_) => warn!("Caller claims are not a valid header value"),
            }
        }
        Err(e) => debug!(error = %e, "Caller token claims not forwarded"),
    }
}
