//! Tracing collaborator used for context propagation on outgoing requests

use hyper::header::{HeaderName, HeaderValue};
use hyper::HeaderMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// W3C trace context header
pub const TRACEPARENT: HeaderName = HeaderName::from_static("traceparent");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanContext {
    /// 32 lowercase hex digits
    pub trace_id: String,

    /// 16 lowercase hex digits
    pub span_id: String,

    pub sampled: bool,
}

pub trait Span: Send + Sync {
    fn context(&self) -> SpanContext;

    fn set_tag(&self, key: &str, value: &str);
}

pub trait Tracer: Send + Sync {
    /// The span outgoing requests should be attributed to
    fn active_span(&self) -> Option<Arc<dyn Span>>;

    /// Write propagation headers for `context` into `carrier`
    fn inject(&self, context: &SpanContext, carrier: &mut HeaderMap);
}

/// A span that records its tags
#[derive(Debug)]
pub struct BasicSpan {
    context: SpanContext,
    tags: Mutex<Vec<(String, String)>>,
}

impl BasicSpan {
    pub fn new(context: SpanContext) -> Self {
        Self {
            context,
            tags: Mutex::new(Vec::new()),
        }
    }

    pub fn tag(&self, key: &str) -> Option<String> {
        self.tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }
}

impl Span for BasicSpan {
    fn context(&self) -> SpanContext {
        self.context.clone()
    }

    fn set_tag(&self, key: &str, value: &str) {
        self.tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((key.to_string(), value.to_string()));
    }
}

/// Injects `traceparent` headers for whichever span is marked active
#[derive(Default)]
pub struct W3cTracer {
    active: RwLock<Option<Arc<dyn Span>>>,
}

impl W3cTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active(&self, span: Option<Arc<dyn Span>>) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = span;
    }

    pub fn traceparent(context: &SpanContext) -> String {
        format!(
            "00-{}-{}-{}",
            context.trace_id,
            context.span_id,
            if context.sampled { "01" } else { "00" }
        )
    }
}

impl Tracer for W3cTracer {
    fn active_span(&self) -> Option<Arc<dyn Span>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn inject(&self, context: &SpanContext, carrier: &mut HeaderMap) {
        match HeaderValue::from_str(&Self::traceparent(context)) {
            Ok(value) => {
                carrier.insert(TRACEPARENT, value);
            }
            Err(e) => tracing::warn!(error = %e, "Span context is not a valid header value"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traceparent_injection() {
        let tracer = W3cTracer::new();
        let context = SpanContext {
            trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".to_string(),
            span_id: "00f067aa0ba902b7".to_string(),
            sampled: true,
        };
        let mut headers = HeaderMap::new();
        tracer.inject(&context, &mut headers);
        assert_eq!(
            headers[TRACEPARENT],
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        );
    }
}
