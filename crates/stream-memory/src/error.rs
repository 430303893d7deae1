use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The publisher was closed.
    #[error("publisher closed")]
    PublisherClosed,

    /// The subscriber was closed.
    #[error("subscriber closed")]
    SubscriberClosed,
}
