use crate::action::BoxError;

use thiserror::Error;

/// Result alias for stream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the dispatch core.
#[derive(Debug, Error)]
pub enum Error {
    /// No dispatcher actions were supplied.
    #[error("metadata dispatcher requires at least one action")]
    ActionsNotSpecified,

    /// `start` was called on a router that is not in the registering state.
    #[error("router already started")]
    AlreadyStarted,

    /// A consumer group had to be derived but no application name is set.
    #[error("binding `{0}`: application name not configured, cannot derive consumer group")]
    ApplicationNameNotConfigured(String),

    /// No provider is registered for the binding's binder.
    #[error("binder `{binder}` not enabled for binding `{binding}`")]
    BinderNotEnabled {
        /// The binding name.
        binding: String,
        /// The binder name that was looked up.
        binder: String,
    },

    /// The binding's consumer is disabled (`auto-startup = false`).
    #[error("consumer not enabled for binding `{0}`")]
    ConsumerNotEnabled(String),

    /// No metadata header name was supplied to the dispatcher.
    #[error("metadata dispatcher requires a header name")]
    HeaderNotSpecified,

    /// The binding's retry policy is malformed.
    #[error("binding `{binding}`: invalid retry policy: {reason}")]
    InvalidRetryPolicy {
        /// The binding name.
        binding: String,
        /// Why the policy was rejected.
        reason: String,
    },

    /// The settings document could not be parsed.
    #[error("invalid stream settings: {0}")]
    InvalidSettings(#[from] toml::de::Error),

    /// A metric family could not be created or registered.
    #[error("metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    /// The provider failed to create a publisher or subscriber.
    #[error("binder `{binder}` failed to create {role} for binding `{binding}`: {source}")]
    Provider {
        /// The binding name.
        binding: String,
        /// The binder name.
        binder: String,
        /// "publisher" or "subscriber".
        role: &'static str,
        /// The provider's error.
        #[source]
        source: BoxError,
    },

    /// The transport failed to publish.
    #[error("failed to publish to `{destination}`: {source}")]
    Publish {
        /// The transport topic.
        destination: String,
        /// The transport error.
        #[source]
        source: BoxError,
    },

    /// Listeners can no longer be added.
    #[error("router already running")]
    RouterRunning,

    /// The payload object could not be serialized.
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The transport failed to subscribe.
    #[error("failed to subscribe to `{destination}`: {source}")]
    Subscribe {
        /// The transport topic.
        destination: String,
        /// The transport error.
        #[source]
        source: BoxError,
    },

    /// An empty topic or binding name was supplied.
    #[error("topic not specified")]
    TopicNotSpecified,
}
