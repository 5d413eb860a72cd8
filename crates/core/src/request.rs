//! Per-call runtime context threaded explicitly into the pipeline and every
//! adapter (spec §9 "Context propagation": "pass a runner-scoped handle
//! explicitly ... do not use process-global state").

use fastrace::{Span, collector::SpanContext};
use secrecy::SecretString;

/// Runtime information that augments or overrides static [`gateway_config::GatewayConfig`]
/// for a single request: a caller-supplied bring-your-own-key credential, a
/// tracing parent, and the request's deadline.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Overrides the configured credential for every provider attempted in
    /// this request, when the caller supplied one (BYOK).
    pub api_key_override: Option<SecretString>,
    pub span_context: Option<SpanContext>,
    /// Wall-clock deadline for the whole request (spec §5 "Each request
    /// carries a deadline; adapter HTTP calls honour it").
    pub deadline: Option<std::time::Instant>,
    pub conversation_id: Option<String>,
}

impl RequestContext {
    pub fn new_span(&self, name: &'static str) -> Span {
        match self.span_context {
            Some(parent) => Span::root(name, parent),
            None => Span::root(name, SpanContext::random()),
        }
    }

    /// Remaining budget before the request's deadline, or `None` if there is
    /// no deadline.
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.deadline.map(|deadline| deadline.saturating_duration_since(std::time::Instant::now()))
    }

    pub fn has_expired(&self) -> bool {
        self.remaining().is_some_and(|remaining| remaining.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_deadline_never_expires() {
        let ctx = RequestContext::default();
        assert!(!ctx.has_expired());
    }

    #[test]
    fn past_deadline_has_expired() {
        let ctx = RequestContext {
            deadline: Some(std::time::Instant::now() - std::time::Duration::from_secs(1)),
            ..Default::default()
        };
        assert!(ctx.has_expired());
    }
}
