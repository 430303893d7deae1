//! Retry decorator.
//!
//! A failing handler is re-invoked until it succeeds, the attempts run out,
//! it fails with a [`PermanentError`], or the message's context is cancelled.
//! Every failure that gives up on the message is logged at error level and
//! then swallowed, so the router still acknowledges the message.

use crate::action::{BoxError, ListenerAction};
use crate::config::{BindingConfiguration, RetryConfig};
use crate::message::Message;

use std::iter;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error};

/// A handler failure that must not be retried.
#[derive(Debug, Error)]
#[error("permanent failure: {0}")]
pub struct PermanentError(#[source] BoxError);

impl PermanentError {
    /// Marks `error` as permanent.
    pub fn new(error: impl Into<BoxError>) -> Self {
        Self(error.into())
    }

    /// The wrapped error.
    #[must_use]
    pub fn into_inner(self) -> BoxError {
        self.0
    }
}

/// Boxes `error` as a [`PermanentError`], ready to return from a handler.
pub fn permanent(error: impl Into<BoxError>) -> BoxError {
    Box::new(PermanentError::new(error))
}

fn is_permanent(error: &BoxError) -> bool {
    error.downcast_ref::<PermanentError>().is_some()
}

/// The sleeps between attempts: one fewer than the number of attempts.
pub fn schedule(policy: &RetryConfig) -> impl Iterator<Item = Duration> {
    let linear = policy.linear;
    let backoff = policy.backoff;

    iter::successors(Some(policy.delay), move |delay| {
        Some(if linear {
            *delay
        } else {
            Duration::try_from_secs_f64(delay.as_secs_f64() * backoff).unwrap_or(Duration::MAX)
        })
    })
    .take(policy.attempts.saturating_sub(1) as usize)
}

/// Retries `next` according to the binding's retry policy.
pub fn decorate(binding: Arc<BindingConfiguration>, next: ListenerAction) -> ListenerAction {
    Arc::new(move |message: Message| {
        let binding = binding.clone();
        let next = next.clone();

        Box::pin(async move {
            let mut delays = schedule(&binding.retry);
            let mut attempt: u32 = 1;

            loop {
                let Err(err) = next(message.clone()).await else {
                    return Ok(());
                };

                if is_permanent(&err) {
                    error!(
                        destination = %binding.destination,
                        message_id = %message.id(),
                        attempt,
                        error = %err,
                        "handler failed permanently, giving up"
                    );
                    return Ok(());
                }

                let Some(delay) = delays.next() else {
                    error!(
                        destination = %binding.destination,
                        message_id = %message.id(),
                        attempt,
                        error = %err,
                        "retries exhausted, dropping message"
                    );
                    return Ok(());
                };

                debug!(
                    destination = %binding.destination,
                    message_id = %message.id(),
                    attempt,
                    ?delay,
                    error = %err,
                    "handler failed, retrying"
                );

                tokio::select! {
                    biased;
                    () = message.context().cancelled() => {
                        error!(
                            destination = %binding.destination,
                            message_id = %message.id(),
                            attempt,
                            error = %err,
                            "retry abandoned on shutdown, dropping message"
                        );
                        return Ok(());
                    }
                    () = tokio::time::sleep(delay) => {}
                }

                attempt += 1;
            }
        })
    })
}
