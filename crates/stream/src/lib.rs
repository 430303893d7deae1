//! Message-stream dispatch core.
//!
//! Applications publish through a [`Registry`] of transport providers and
//! consume through a [`Router`], which subscribes listeners to their bindings
//! and runs every inbound message through tracing, metrics, retry and panic
//! recovery before acknowledging it.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod action;
mod context;
mod error;
mod message;
mod publish;

pub mod config;

/// Routes one subscription to many handlers by a metadata header.
pub mod dispatcher;

pub mod observe;

/// Transport provider interfaces.
pub mod provider;

/// Panic recovery decorator.
pub mod recover;

/// Binder name to provider registry.
pub mod registry;

pub mod retry;
pub mod router;

pub mod stats;

pub mod trace;

pub use action::{ActionFuture, BoxError, ListenerAction, action};
pub use config::{
    BindingConfiguration, BindingSettings, ConsumerConfiguration, ConsumerSettings, RetryConfig,
    RetrySettings, StreamSettings,
};
pub use context::Context;
pub use dispatcher::MetadataDispatcher;
pub use error::{Error, Result};
pub use message::{Message, Metadata};
pub use observe::{Direction, Endpoint, NoopObserver, Observe, PrometheusObserver};
pub use provider::{Provider, Publisher, Subscriber};
pub use registry::Registry;
pub use retry::{PermanentError, permanent};
pub use router::{Router, RouterState};
pub use trace::{LogTracer, Span, SpanContext, Tracer};
