use crate::action::BoxError;
use crate::config::{BindingConfiguration, StreamSettings};
use crate::context::Context;
use crate::message::Message;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Outbound side of a transport binding.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Sends one message to the binding's destination.
    async fn publish(&self, message: Message) -> Result<(), BoxError>;

    /// Releases the publisher.
    async fn close(&self) -> Result<(), BoxError>;
}

/// Inbound side of a transport binding.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Starts delivering messages from `topic`.
    ///
    /// Delivery ends when `ctx` is cancelled or the subscriber is closed.
    async fn subscribe(
        &self,
        ctx: &Context,
        topic: &str,
    ) -> Result<mpsc::Receiver<Message>, BoxError>;

    /// Releases the subscriber and stops its deliveries.
    async fn close(&self) -> Result<(), BoxError>;
}

/// A transport, registered under a binder name.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a publisher for the binding `name`.
    async fn new_publisher(
        &self,
        settings: &StreamSettings,
        name: &str,
        binding: &BindingConfiguration,
    ) -> Result<Box<dyn Publisher>, BoxError>;

    /// Creates a subscriber for the binding `name`.
    async fn new_subscriber(
        &self,
        settings: &StreamSettings,
        name: &str,
        binding: &BindingConfiguration,
    ) -> Result<Box<dyn Subscriber>, BoxError>;
}
