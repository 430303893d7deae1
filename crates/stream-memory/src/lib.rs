//! In-process transport for the stream dispatch core.
//!
//! A [`MemoryBroker`] fans every published message out to all subscriptions
//! of its destination. Each subscription hands messages to its consumer one
//! at a time and waits for the previous one to be acknowledged first.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_stream::{
    BindingConfiguration, BoxError, Context, Message, Provider, Publisher, StreamSettings,
    Subscriber,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Binder name the memory provider is usually registered under.
pub const BINDER_NAME: &str = "gochannel";

type Inbox = mpsc::UnboundedSender<Message>;

/// Shared per-topic fan-out state.
#[derive(Clone, Debug, Default)]
pub struct MemoryBroker {
    topics: Arc<Mutex<HashMap<String, Vec<Inbox>>>>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a copy of `message` to every live subscription of `topic`.
    ///
    /// Every copy has its own acknowledgment state.
    pub fn publish(&self, topic: &str, message: &Message) {
        let mut topics = self.topics.lock();
        let Some(inboxes) = topics.get_mut(topic) else {
            debug!(topic, message_id = %message.id(), "no subscriptions, dropping message");
            return;
        };

        inboxes.retain(|inbox| {
            let copy = Message::with_id(message.id(), message.payload().clone())
                .with_metadata(message.metadata().clone());
            inbox.send(copy).is_ok()
        });
    }

    /// Number of live subscriptions of `topic`.
    #[must_use]
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, |inboxes| inboxes.iter().filter(|inbox| !inbox.is_closed()).count())
    }

    fn register(&self, topic: &str) -> mpsc::UnboundedReceiver<Message> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock();
        let inboxes = topics.entry(topic.to_string()).or_default();
        inboxes.retain(|inbox| !inbox.is_closed());
        inboxes.push(sender);
        receiver
    }
}

/// Provider creating publishers and subscribers on a shared broker.
#[derive(Clone, Debug, Default)]
pub struct MemoryProvider {
    broker: MemoryBroker,
}

impl MemoryProvider {
    /// Creates a provider on `broker`.
    #[must_use]
    pub const fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }

    /// The broker messages travel through.
    #[must_use]
    pub const fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn new_publisher(
        &self,
        _settings: &StreamSettings,
        name: &str,
        binding: &BindingConfiguration,
    ) -> Result<Box<dyn Publisher>, BoxError> {
        debug!(binding = name, destination = %binding.destination, "creating memory publisher");
        Ok(Box::new(MemoryPublisher {
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
            destination: binding.destination.clone(),
        }))
    }

    async fn new_subscriber(
        &self,
        _settings: &StreamSettings,
        name: &str,
        binding: &BindingConfiguration,
    ) -> Result<Box<dyn Subscriber>, BoxError> {
        debug!(binding = name, group = %binding.group, "creating memory subscriber");
        Ok(Box::new(MemorySubscriber::new(self.broker.clone())))
    }
}

/// Publishes to one destination of a broker.
#[derive(Debug)]
pub struct MemoryPublisher {
    broker: MemoryBroker,
    closed: AtomicBool,
    destination: String,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, message: Message) -> Result<(), BoxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Box::new(Error::PublisherClosed));
        }

        self.broker.publish(&self.destination, &message);
        Ok(())
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Subscribes to broker topics.
#[derive(Debug)]
pub struct MemorySubscriber {
    broker: MemoryBroker,
    closed: AtomicBool,
    stop: CancellationToken,
}

impl MemorySubscriber {
    /// Creates a subscriber on `broker`.
    #[must_use]
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            closed: AtomicBool::new(false),
            stop: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn subscribe(
        &self,
        ctx: &Context,
        topic: &str,
    ) -> Result<mpsc::Receiver<Message>, BoxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Box::new(Error::SubscriberClosed));
        }

        let inbox = self.broker.register(topic);
        let (sender, receiver) = mpsc::channel(1);

        tokio::spawn(pump(
            topic.to_string(),
            inbox,
            sender,
            self.stop.clone(),
            ctx.clone(),
        ));

        Ok(receiver)
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.closed.store(true, Ordering::Release);
        self.stop.cancel();
        Ok(())
    }
}

/// Forwards inbox messages one at a time, waiting for each ack.
async fn pump(
    topic: String,
    mut inbox: mpsc::UnboundedReceiver<Message>,
    sender: mpsc::Sender<Message>,
    stop: CancellationToken,
    ctx: Context,
) {
    loop {
        let message = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            () = ctx.cancelled() => break,
            message = inbox.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            () = ctx.cancelled() => break,
            sent = sender.send(message.clone()) => if sent.is_err() {
                break;
            },
        }

        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            () = ctx.cancelled() => break,
            () = message.acked() => {
                debug!(topic = %topic, message_id = %message.id(), "message acknowledged");
            }
        }
    }

    debug!(topic = %topic, "subscription stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::time::timeout;

    fn binding(destination: &str) -> BindingConfiguration {
        let settings = StreamSettings {
            application_name: Some("svc".to_string()),
            ..StreamSettings::default()
        };
        let mut binding = settings.binding(destination).unwrap();
        binding.binder = BINDER_NAME.to_string();
        binding
    }

    #[tokio::test]
    async fn test_next_message_waits_for_ack() {
        let provider = MemoryProvider::new(MemoryBroker::new());
        let settings = StreamSettings::default();
        let subscriber = provider
            .new_subscriber(&settings, "orders", &binding("orders"))
            .await
            .unwrap();
        let publisher = provider
            .new_publisher(&settings, "orders", &binding("orders"))
            .await
            .unwrap();
        let mut receiver = subscriber
            .subscribe(&Context::background(), "orders")
            .await
            .unwrap();

        publisher.publish(Message::new("first")).await.unwrap();
        publisher.publish(Message::new("second")).await.unwrap();

        let first = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.payload().as_ref(), b"first");
        assert!(
            timeout(Duration::from_millis(50), receiver.recv())
                .await
                .is_err()
        );

        first.ack();
        let second = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.payload().as_ref(), b"second");
    }

    #[tokio::test]
    async fn test_fan_out_copies_have_independent_acks() {
        let broker = MemoryBroker::new();
        let left = MemorySubscriber::new(broker.clone());
        let right = MemorySubscriber::new(broker.clone());
        let mut left_rx = left.subscribe(&Context::background(), "t").await.unwrap();
        let mut right_rx = right.subscribe(&Context::background(), "t").await.unwrap();
        assert_eq!(broker.subscription_count("t"), 2);

        broker.publish("t", &Message::new("{}").with_metadata([("k", "v")]));

        let a = left_rx.recv().await.unwrap();
        let b = right_rx.recv().await.unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(b.metadata().get("k").map(String::as_str), Some("v"));
        a.ack();
        assert!(!b.is_acked());
    }

    #[tokio::test]
    async fn test_close_ends_deliveries_and_rejects_subscribe() {
        let broker = MemoryBroker::new();
        let subscriber = MemorySubscriber::new(broker.clone());
        let mut receiver = subscriber
            .subscribe(&Context::background(), "t")
            .await
            .unwrap();

        subscriber.close().await.unwrap();

        assert!(
            timeout(Duration::from_secs(1), receiver.recv())
                .await
                .unwrap()
                .is_none()
        );
        let err = subscriber
            .subscribe(&Context::background(), "t")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "subscriber closed");
    }

    #[tokio::test]
    async fn test_resubscribing_prunes_closed_inboxes() {
        let broker = MemoryBroker::new();

        for _ in 0..5 {
            let subscriber = MemorySubscriber::new(broker.clone());
            let mut receiver = subscriber
                .subscribe(&Context::background(), "quiet")
                .await
                .unwrap();
            subscriber.close().await.unwrap();
            assert!(
                timeout(Duration::from_secs(1), receiver.recv())
                    .await
                    .unwrap()
                    .is_none()
            );
        }
        let _live = MemorySubscriber::new(broker.clone())
            .subscribe(&Context::background(), "quiet")
            .await
            .unwrap();

        assert!(broker.topics.lock()["quiet"].len() <= 2);
        assert_eq!(broker.subscription_count("quiet"), 1);
    }

    #[tokio::test]
    async fn test_closed_publisher_rejects_messages() {
        let provider = MemoryProvider::default();
        let publisher = provider
            .new_publisher(&StreamSettings::default(), "t", &binding("t"))
            .await
            .unwrap();

        publisher.close().await.unwrap();

        assert!(publisher.publish(Message::new("{}")).await.is_err());
    }
}
