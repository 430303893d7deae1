use crate::context::Context;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;
use uuid::Uuid;

/// String to string message headers.
pub type Metadata = HashMap<String, String>;

/// A message travelling through a binding.
///
/// Clones share one acknowledgment state, so a message is acked at most once
/// no matter how many layers hold a copy.
#[derive(Clone, Debug)]
pub struct Message {
    id: Uuid,
    payload: Bytes,
    metadata: Metadata,
    context: Context,
    ack: Arc<watch::Sender<bool>>,
}

impl Message {
    /// Creates a message with a fresh id.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self::with_id(Uuid::new_v4(), payload)
    }

    /// Creates a message with the given id.
    pub fn with_id(id: Uuid, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
            metadata: Metadata::new(),
            context: Context::background(),
            ack: Arc::new(watch::channel(false).0),
        }
    }

    /// Returns the message with the given metadata merged in.
    #[must_use]
    pub fn with_metadata<I, K, V>(mut self, metadata: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.metadata
            .extend(metadata.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Returns the message with its context replaced.
    #[must_use]
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// The unique message id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// The raw payload.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The message headers.
    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Mutable access to the message headers.
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// The attached context.
    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.context
    }

    /// Replaces the attached context.
    pub fn set_context(&mut self, context: Context) {
        self.context = context;
    }

    /// Acknowledges the message.
    ///
    /// Returns `true` only for the first acknowledgment across all clones.
    pub fn ack(&self) -> bool {
        self.ack.send_if_modified(|acked| {
            if *acked {
                false
            } else {
                *acked = true;
                true
            }
        })
    }

    /// Whether the message has been acknowledged.
    #[must_use]
    pub fn is_acked(&self) -> bool {
        *self.ack.borrow()
    }

    /// Resolves once the message has been acknowledged.
    pub async fn acked(&self) {
        let mut receiver = self.ack.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = receiver.wait_for(|acked| *acked).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::time::timeout;

    #[test]
    fn test_ack_is_reported_once_across_clones() {
        let message = Message::new("payload");
        let clone = message.clone();

        assert!(!message.is_acked());
        assert!(clone.ack());
        assert!(!message.ack());
        assert!(message.is_acked());
    }

    #[test]
    fn test_metadata_changes_do_not_leak_into_clones() {
        let message = Message::new("payload").with_metadata([("k", "v")]);
        let mut clone = message.clone();
        clone.metadata_mut().insert("other".to_string(), "x".to_string());

        assert_eq!(message.metadata().len(), 1);
        assert_eq!(clone.metadata().len(), 2);
        assert_eq!(message.id(), clone.id());
    }

    #[tokio::test]
    async fn test_acked_resolves_after_ack() {
        let message = Message::new("payload");
        let waiter = {
            let message = message.clone();
            tokio::spawn(async move { message.acked().await })
        };

        tokio::task::yield_now().await;
        message.ack();

        timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_acked_resolves_immediately_when_already_acked() {
        let message = Message::new("payload");
        message.ack();

        timeout(Duration::from_millis(100), message.acked())
            .await
            .unwrap();
    }
}
