//! Unverified JWT claim extraction
//!
//! Tokens were already validated by whoever issued them to us; these helpers
//! only read the payload to learn expiry or forward caller claims.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{Map, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, thiserror::Error)]
pub enum ClaimsError {
    #[error("Token is not a JWT")]
    Malformed,

    #[error("Invalid base64 in JWT payload: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Invalid JSON in JWT payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JWT payload is not an object")]
    NotAnObject,
}

/// Strip a case-insensitive `Bearer ` prefix
pub fn strip_bearer(token: &str) -> &str {
    let token = token.trim();
    match token.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => token[7..].trim_start(),
        _ => token,
    }
}

/// Decode the payload of a compact JWS without checking its signature
pub fn extract_claims(token: &str) -> Result<Map<String, Value>, ClaimsError> {
    let mut parts = strip_bearer(token).split('.');
    let (Some(_header), Some(payload), Some(_signature)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ClaimsError::Malformed);
    };
    if parts.next().is_some() || payload.is_empty() {
        return Err(ClaimsError::Malformed);
    }

    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
    match serde_json::from_slice::<Value>(&decoded)? {
        Value::Object(claims) => Ok(claims),
        _ => Err(ClaimsError::NotAnObject),
    }
}

/// Time left before the `exp` claim, or `None` when absent or already past
pub fn expires_in(claims: &Map<String, Value>) -> Option<Duration> {
    let exp = claims.get("exp")?.as_u64()?;
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
    exp.checked_sub(now)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

#[cfg(test)]
pub(crate) fn encode_test_jwt(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.signature", header, payload)
}
