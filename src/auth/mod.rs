//! Outgoing request identity
//!
//! - `token`: client-credentials tokens and their cache
//! - `inject`: header decoration (auth, correlation, caller id, tracing)
//! - `claims`: unverified JWT payload reading
//! - `trace`: tracer collaborator and a W3C implementation

pub mod claims;
pub mod inject;
pub mod token;
pub mod trace;

pub use inject::{
    add_auth_token, normalize_bearer, AuthHeaderInjector, InjectorSettings, RequestContext,
    CALLER_ID, CORRELATION_ID, JWT_CLAIMS, SCOPE_TOKEN, TRACEABILITY_ID,
};
pub use token::{
    form_data_string, AuthTokenError, CachedToken, ClientCredentials, OAuth2TokenSource,
    StaticTokenSource, TokenCache, TokenSource,
};
pub use trace::{BasicSpan, Span, SpanContext, Tracer, W3cTracer, TRACEPARENT};
