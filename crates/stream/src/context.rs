use crate::trace::SpanContext;

use tokio_util::sync::CancellationToken;

/// Cancellable context carried by messages and passed to lifecycle calls.
#[derive(Clone, Debug, Default)]
pub struct Context {
    cancellation: CancellationToken,
    span: Option<SpanContext>,
}

impl Context {
    /// A fresh, uncancelled context with no span.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that is cancelled whenever this one is, keeping the span.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            cancellation: self.cancellation.child_token(),
            span: self.span.clone(),
        }
    }

    /// Returns a copy of this context carrying the given span.
    #[must_use]
    pub fn with_span(&self, span: SpanContext) -> Self {
        Self {
            cancellation: self.cancellation.clone(),
            span: Some(span),
        }
    }

    /// The current span, if any.
    #[must_use]
    pub const fn span(&self) -> Option<&SpanContext> {
        self.span.as_ref()
    }

    /// The underlying cancellation token.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Cancels this context and all of its children.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Whether the context has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }
}
