//! Span factory consumed by the core. Built directly on `tracing`: a real
//! collector (OTLP exporter, etc.) attaches as a `tracing_subscriber` layer
//! outside this crate's concern.

use rand::Rng;
use tracing::Span;

/// A single operation's span, with the handful of operations the core
/// actually needs (attribute tagging, error/success marking).
#[derive(Clone)]
pub struct OperationSpan {
    span: Span,
}

impl OperationSpan {
    fn new(span: Span) -> Self {
        Self { span }
    }

    pub fn set_attribute(&self, key: &str, value: impl std::fmt::Display) {
        self.span.record(key, tracing::field::display(value));
    }

    pub fn set_error(&self, message: &str) {
        self.span.record("error", tracing::field::display(message));
        tracing::error!(parent: &self.span, "{message}");
    }

    pub fn set_success(&self) {
        self.span.record("outcome", "success");
    }

    pub fn record_exception(&self, err: &(dyn std::error::Error + 'static)) {
        tracing::error!(parent: &self.span, error = %err, "exception recorded");
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

/// Process-wide span factory. Stateless; cloning is cheap.
#[derive(Clone, Default)]
pub struct Observability;

impl Observability {
    pub fn new() -> Self {
        Self
    }

    pub fn create_span(&self, name: &'static str, parent: Option<&OperationSpan>) -> OperationSpan {
        let span = match parent {
            Some(p) => tracing::info_span!(parent: &p.span, "op", name, outcome = tracing::field::Empty, error = tracing::field::Empty),
            None => tracing::info_span!("op", name, outcome = tracing::field::Empty, error = tracing::field::Empty),
        };
        OperationSpan::new(span)
    }

    /// Like `create_span`, but only actually emits at the given sampling
    /// rate (0.0-1.0). Used for the per-runner-firing trace, which would
    /// otherwise dominate trace volume at a 1ms tick.
    pub fn create_sampled_span(
        &self,
        name: &'static str,
        parent: Option<&OperationSpan>,
        rate: f64,
    ) -> Option<OperationSpan> {
        if rand::thread_rng().gen::<f64>() >= rate {
            return None;
        }
        Some(self.create_span(name, parent))
    }
}
