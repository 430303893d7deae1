//! Distributed tracing for bindings.
//!
//! Span contexts travel in message metadata as B3 headers. Inbound messages
//! get a `"<binder> receive <destination>"` span that is a child of the
//! upstream one, outbound messages a `"<binder> send <destination>"` span.

/// B3 header propagation.
pub mod carrier;

use crate::action::{BoxError, ListenerAction};
use crate::config::BindingConfiguration;
use crate::message::Message;
use crate::provider::Publisher;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{Instrument, debug, info_span};

/// Identity of one span within a trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpanContext {
    /// Hex trace id shared by every span of the trace.
    pub trace_id: String,
    /// Hex id of this span.
    pub span_id: String,
    /// Hex id of the parent span.
    pub parent_span_id: Option<String>,
    /// Whether the trace is sampled.
    pub sampled: bool,
}

/// Tracing backend.
pub trait Tracer: Debug + Send + Sync {
    /// Starts a span, as a child of `parent` if given and as a root otherwise.
    fn start_span(&self, name: &str, parent: Option<&SpanContext>) -> Box<dyn Span>;
}

/// A started span. Must be finished exactly once.
pub trait Span: Send {
    /// The span's identity.
    fn context(&self) -> &SpanContext;

    /// Marks the span as failed.
    fn record_error(&mut self, error: &(dyn std::error::Error + 'static));

    /// Ends the span.
    fn finish(self: Box<Self>);

    /// A `tracing` span to run the traced work in, if the backend has one.
    fn tracing_span(&self) -> Option<tracing::Span> {
        None
    }
}

/// Default tracer: random ids, each span mirrored as a `tracing` span.
#[derive(Debug, Default)]
pub struct LogTracer;

impl Tracer for LogTracer {
    fn start_span(&self, name: &str, parent: Option<&SpanContext>) -> Box<dyn Span> {
        let span_id = format!("{:016x}", rand::random::<u64>());
        let context = match parent {
            Some(parent) => SpanContext {
                trace_id: parent.trace_id.clone(),
                span_id,
                parent_span_id: Some(parent.span_id.clone()),
                sampled: parent.sampled,
            },
            None => SpanContext {
                trace_id: format!("{:032x}", rand::random::<u128>()),
                span_id,
                parent_span_id: None,
                sampled: true,
            },
        };

        let span = info_span!(
            "stream.span",
            name,
            trace_id = %context.trace_id,
            span_id = %context.span_id,
        );

        Box::new(LogSpan {
            context,
            error: None,
            name: name.to_string(),
            span,
            started: Instant::now(),
        })
    }
}

struct LogSpan {
    context: SpanContext,
    error: Option<String>,
    name: String,
    span: tracing::Span,
    started: Instant,
}

impl Span for LogSpan {
    fn context(&self) -> &SpanContext {
        &self.context
    }

    fn record_error(&mut self, error: &(dyn std::error::Error + 'static)) {
        self.error = Some(error.to_string());
    }

    fn finish(self: Box<Self>) {
        let _entered = self.span.enter();
        debug!(
            name = %self.name,
            elapsed = ?self.started.elapsed(),
            error = self.error.as_deref(),
            "span finished"
        );
    }

    fn tracing_span(&self) -> Option<tracing::Span> {
        Some(self.span.clone())
    }
}

/// Wraps `next` in a receive span continued from the message's B3 headers.
///
/// The inner action sees a message whose context carries the new span.
pub fn decorate(
    tracer: Arc<dyn Tracer>,
    binding: Arc<BindingConfiguration>,
    next: ListenerAction,
) -> ListenerAction {
    let name: Arc<str> = format!("{} receive {}", binding.binder, binding.destination).into();

    Arc::new(move |mut message: Message| {
        let tracer = tracer.clone();
        let next = next.clone();
        let name = name.clone();

        Box::pin(async move {
            let parent = carrier::extract(message.metadata()).ok();
            let mut span = tracer.start_span(&name, parent.as_ref());

            let context = message.context().with_span(span.context().clone());
            message.set_context(context);

            let result = match span.tracing_span() {
                Some(tracing_span) => next(message).instrument(tracing_span).await,
                None => next(message).await,
            };

            if let Err(error) = &result {
                span.record_error(error.as_ref());
            }
            span.finish();

            result
        })
    })
}

/// Publisher that opens a send span and injects it into outgoing metadata.
pub struct TracePublisher {
    inner: Box<dyn Publisher>,
    name: String,
    tracer: Arc<dyn Tracer>,
}

impl TracePublisher {
    /// Wraps `inner` for the given binding.
    pub fn new(
        tracer: Arc<dyn Tracer>,
        binding: &BindingConfiguration,
        inner: Box<dyn Publisher>,
    ) -> Self {
        Self {
            inner,
            name: format!("{} send {}", binding.binder, binding.destination),
            tracer,
        }
    }
}

#[async_trait]
impl Publisher for TracePublisher {
    async fn publish(&self, mut message: Message) -> Result<(), BoxError> {
        let mut span = self.tracer.start_span(&self.name, message.context().span());
        carrier::inject(span.context(), message.metadata_mut());

        let result = self.inner.publish(message).await;

        if let Err(error) = &result {
            span.record_error(error.as_ref());
        }
        span.finish();

        result
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::action::action;
    use crate::config::StreamSettings;
    use crate::context::Context;

    use std::io;

    use parking_lot::Mutex;

    fn binding() -> Arc<BindingConfiguration> {
        let settings = StreamSettings {
            application_name: Some("testservice".to_string()),
            ..StreamSettings::default()
        };
        Arc::new(settings.binding("orders").unwrap())
    }

    #[test]
    fn test_child_span_continues_trace() {
        let root = LogTracer.start_span("root", None);
        let child = LogTracer.start_span("child", Some(root.context()));

        assert_eq!(root.context().trace_id.len(), 32);
        assert_eq!(root.context().span_id.len(), 16);
        assert_eq!(child.context().trace_id, root.context().trace_id);
        assert_eq!(
            child.context().parent_span_id.as_ref(),
            Some(&root.context().span_id)
        );
        assert_ne!(child.context().span_id, root.context().span_id);

        child.finish();
        root.finish();
    }

    #[tokio::test]
    async fn test_decorate_continues_upstream_trace() {
        let seen = Arc::new(Mutex::new(None));
        let inner = {
            let seen = seen.clone();
            action(move |message: Message| {
                let seen = seen.clone();
                async move {
                    *seen.lock() = message.context().span().cloned();
                    Ok(())
                }
            })
        };
        let decorated = decorate(Arc::new(LogTracer), binding(), inner);

        let message =
            Message::new("{}").with_metadata([("b3", "463ac35c9f6413ad-a2fb4a1d1a96d312-1")]);
        decorated(message).await.unwrap();

        let span = seen.lock().clone().unwrap();
        assert_eq!(span.trace_id, "463ac35c9f6413ad");
        assert_eq!(span.parent_span_id.as_deref(), Some("a2fb4a1d1a96d312"));
    }

    #[tokio::test]
    async fn test_decorate_starts_root_span_without_carrier() {
        let seen = Arc::new(Mutex::new(None));
        let inner = {
            let seen = seen.clone();
            action(move |message: Message| {
                let seen = seen.clone();
                async move {
                    *seen.lock() = message.context().span().cloned();
                    Err::<(), BoxError>(Box::new(io::Error::other("boom")))
                }
            })
        };
        let decorated = decorate(Arc::new(LogTracer), binding(), inner);

        let result = decorated(Message::new("{}").with_context(Context::background())).await;

        assert!(result.is_err());
        let span = seen.lock().clone().unwrap();
        assert_eq!(span.parent_span_id, None);
    }
}
