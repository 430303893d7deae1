//! Mock transport for testing code built on the stream dispatch core.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_stream::{
    BindingConfiguration, BoxError, Context, Message, Provider, Publisher, StreamSettings,
    Subscriber,
};
use tokio::sync::mpsc;
use tracing::debug;

/// Binder name the mock provider is usually registered under.
pub const BINDER_NAME: &str = "mock";

/// A message handed to a mock publisher.
#[derive(Clone, Debug)]
pub struct Published {
    /// The binding the publisher was created for.
    pub binding: String,
    /// The binding's destination.
    pub destination: String,
    /// The message as the publisher received it.
    pub message: Message,
}

struct Subscription {
    sender: mpsc::Sender<Message>,
    subscriber: u64,
    topic: String,
}

#[derive(Default)]
struct State {
    closed_publishers: AtomicU64,
    closed_subscribers: AtomicU64,
    failing: Mutex<HashSet<String>>,
    next_subscriber: AtomicU64,
    published: Mutex<Vec<Published>>,
    publishers: Mutex<Vec<String>>,
    subscribers: Mutex<Vec<String>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Provider that records everything and lets tests drive subscriptions.
#[derive(Clone, Default)]
pub struct MockProvider {
    state: Arc<State>,
}

impl MockProvider {
    /// Creates an empty mock provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes publisher and subscriber creation fail for binding `name`.
    pub fn fail_binding(&self, name: impl Into<String>) {
        self.state.failing.lock().insert(name.into());
    }

    /// Binding names of every publisher created so far.
    #[must_use]
    pub fn publishers(&self) -> Vec<String> {
        self.state.publishers.lock().clone()
    }

    /// Binding names of every subscriber created so far.
    #[must_use]
    pub fn subscribers(&self) -> Vec<String> {
        self.state.subscribers.lock().clone()
    }

    /// Every message published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<Published> {
        self.state.published.lock().clone()
    }

    /// Number of publishers that have been closed.
    #[must_use]
    pub fn closed_publishers(&self) -> u64 {
        self.state.closed_publishers.load(Ordering::SeqCst)
    }

    /// Number of subscribers that have been closed.
    #[must_use]
    pub fn closed_subscribers(&self) -> u64 {
        self.state.closed_subscribers.load(Ordering::SeqCst)
    }

    /// Whether a live subscription exists for `topic`.
    #[must_use]
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.state
            .subscriptions
            .lock()
            .iter()
            .any(|subscription| subscription.topic == topic && !subscription.sender.is_closed())
    }

    /// Pushes `message` into every subscription of `topic`.
    ///
    /// The returned handle shares the message's acknowledgment state, so
    /// `handle.acked().await` waits for the consumer.
    ///
    /// # Errors
    /// [`Error::NotSubscribed`] if no subscription of `topic` accepted it.
    pub async fn deliver(&self, topic: &str, message: Message) -> Result<Message, Error> {
        let senders: Vec<_> = self
            .state
            .subscriptions
            .lock()
            .iter()
            .filter(|subscription| subscription.topic == topic)
            .map(|subscription| subscription.sender.clone())
            .collect();

        let mut delivered = false;
        for sender in senders {
            delivered |= sender.send(message.clone()).await.is_ok();
        }

        if delivered {
            debug!(topic, message_id = %message.id(), "mock message delivered");
            Ok(message)
        } else {
            Err(Error::NotSubscribed(topic.to_string()))
        }
    }

    fn check(&self, name: &str) -> Result<(), BoxError> {
        if self.state.failing.lock().contains(name) {
            return Err(Box::new(Error::Injected(name.to_string())));
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn new_publisher(
        &self,
        _settings: &StreamSettings,
        name: &str,
        binding: &BindingConfiguration,
    ) -> Result<Box<dyn Publisher>, BoxError> {
        self.check(name)?;
        self.state.publishers.lock().push(name.to_string());

        Ok(Box::new(MockPublisher {
            binding: name.to_string(),
            closed: AtomicBool::new(false),
            destination: binding.destination.clone(),
            state: self.state.clone(),
        }))
    }

    async fn new_subscriber(
        &self,
        _settings: &StreamSettings,
        name: &str,
        _binding: &BindingConfiguration,
    ) -> Result<Box<dyn Subscriber>, BoxError> {
        self.check(name)?;
        self.state.subscribers.lock().push(name.to_string());

        Ok(Box::new(MockSubscriber {
            closed: AtomicBool::new(false),
            id: self.state.next_subscriber.fetch_add(1, Ordering::SeqCst),
            state: self.state.clone(),
        }))
    }
}

struct MockPublisher {
    binding: String,
    closed: AtomicBool,
    destination: String,
    state: Arc<State>,
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, message: Message) -> Result<(), BoxError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Box::new(Error::Closed));
        }

        self.state.published.lock().push(Published {
            binding: self.binding.clone(),
            destination: self.destination.clone(),
            message,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BoxError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closed_publishers.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MockSubscriber {
    closed: AtomicBool,
    id: u64,
    state: Arc<State>,
}

#[async_trait]
impl Subscriber for MockSubscriber {
    async fn subscribe(
        &self,
        _ctx: &Context,
        topic: &str,
    ) -> Result<mpsc::Receiver<Message>, BoxError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Box::new(Error::Closed));
        }

        let (sender, receiver) = mpsc::channel(16);
        self.state.subscriptions.lock().push(Subscription {
            sender,
            subscriber: self.id,
            topic: topic.to_string(),
        });
        Ok(receiver)
    }

    async fn close(&self) -> Result<(), BoxError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state
                .subscriptions
                .lock()
                .retain(|subscription| subscription.subscriber != self.id);
            self.state.closed_subscribers.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding() -> BindingConfiguration {
        let settings = StreamSettings {
            application_name: Some("svc".to_string()),
            ..StreamSettings::default()
        };
        settings.binding("orders").unwrap()
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let provider = MockProvider::new();
        provider.fail_binding("orders");

        let result = provider
            .new_subscriber(&StreamSettings::default(), "orders", &binding())
            .await;

        assert!(result.is_err());
        assert!(provider.subscribers().is_empty());
    }

    #[tokio::test]
    async fn test_deliver_reaches_subscription_until_closed() {
        let provider = MockProvider::new();
        let subscriber = provider
            .new_subscriber(&StreamSettings::default(), "orders", &binding())
            .await
            .unwrap();
        let mut receiver = subscriber
            .subscribe(&Context::background(), "orders")
            .await
            .unwrap();

        let handle = provider.deliver("orders", Message::new("{}")).await.unwrap();
        receiver.recv().await.unwrap().ack();
        assert!(handle.is_acked());

        subscriber.close().await.unwrap();
        assert!(!provider.is_subscribed("orders"));
        assert_eq!(
            provider.deliver("orders", Message::new("{}")).await.unwrap_err(),
            Error::NotSubscribed("orders".to_string())
        );
        assert_eq!(provider.closed_subscribers(), 1);
    }
}
