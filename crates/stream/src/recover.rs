use crate::action::{BoxError, ListenerAction};
use crate::config::BindingConfiguration;
use crate::message::Message;

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tracing::error;

/// A handler panic converted into an error.
#[derive(Debug, Error)]
#[error("Exception: {0}")]
pub struct PanicError(String);

/// Converts a panic payload into an error.
///
/// Boxed errors raised with `panic_any` are returned unchanged.
pub fn panic_error(payload: Box<dyn Any + Send>) -> BoxError {
    let payload = match payload.downcast::<BoxError>() {
        Ok(error) => return *error,
        Err(payload) => payload,
    };

    let text = payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(ToString::to_string))
        .unwrap_or_else(|| "unknown panic payload".to_string());

    Box::new(PanicError(text))
}

/// Runs `next` behind a panic boundary.
///
/// A panic, whether raised while building the handler future or while
/// polling it, is logged with a backtrace, the message is acknowledged and
/// the call reports success. Panics are never retried.
pub fn decorate(binding: Arc<BindingConfiguration>, next: ListenerAction) -> ListenerAction {
    Arc::new(move |message: Message| {
        let binding = binding.clone();
        let next = next.clone();

        Box::pin(async move {
            let handle = message.clone();
            let outcome = AssertUnwindSafe(async move { next(message).await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(result) => result,
                Err(payload) => {
                    let err = panic_error(payload);
                    error!(
                        destination = %binding.destination,
                        message_id = %handle.id(),
                        error = %err,
                        backtrace = %Backtrace::force_capture(),
                        "recovered from handler panic"
                    );
                    handle.ack();
                    Ok(())
                }
            }
        })
    })
}
