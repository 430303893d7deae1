use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The publisher or subscriber was closed.
    #[error("closed")]
    Closed,

    /// A failure injected with `MockProvider::fail_binding`.
    #[error("injected failure for binding `{0}`")]
    Injected(String),

    /// No live subscription for the topic.
    #[error("no subscription for topic `{0}`")]
    NotSubscribed(String),
}
