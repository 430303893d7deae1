use crate::message::Message;

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

/// Boxed error returned by handlers and transports.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Future returned by a [`ListenerAction`].
pub type ActionFuture = BoxFuture<'static, Result<(), BoxError>>;

/// Application handler for one inbound message.
///
/// The router only looks at the outcome: `Ok`, `Err` or a panic.
pub type ListenerAction = Arc<dyn Fn(Message) -> ActionFuture + Send + Sync>;

/// Wraps an async closure into a [`ListenerAction`].
pub fn action<F, Fut>(f: F) -> ListenerAction
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}
