//! Metrics wrappers for publishers, subscribers and handlers.

use crate::action::{BoxError, ListenerAction};
use crate::config::BindingConfiguration;
use crate::context::Context;
use crate::message::Message;
use crate::observe::{Direction, Endpoint, Observe};
use crate::provider::{Publisher, Subscriber};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Tracks the connection and endpoint gauges of one wrapper.
struct Gauges {
    closed: AtomicBool,
    endpoint: Endpoint,
    observer: Arc<dyn Observe>,
}

impl Gauges {
    fn open(observer: Arc<dyn Observe>, endpoint: Endpoint) -> Self {
        observer.connections(&endpoint.binder, 1);
        observer.endpoints(&endpoint, 1);
        Self {
            closed: AtomicBool::new(false),
            endpoint,
            observer,
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.observer.connections(&self.endpoint.binder, -1);
            self.observer.endpoints(&self.endpoint, -1);
        }
    }
}

/// Publisher that counts and times every send.
pub struct StatsPublisher {
    gauges: Gauges,
    inner: Box<dyn Publisher>,
}

impl StatsPublisher {
    /// Wraps `inner` and counts it as a live publisher.
    pub fn new(
        observer: Arc<dyn Observe>,
        binding: &BindingConfiguration,
        inner: Box<dyn Publisher>,
    ) -> Self {
        let endpoint = Endpoint::new(&binding.binder, &binding.destination, Direction::Publisher);
        Self {
            gauges: Gauges::open(observer, endpoint),
            inner,
        }
    }
}

#[async_trait]
impl Publisher for StatsPublisher {
    async fn publish(&self, message: Message) -> Result<(), BoxError> {
        let Gauges {
            endpoint, observer, ..
        } = &self.gauges;

        observer.message(endpoint);
        let started = Instant::now();
        let result = self.inner.publish(message).await;
        observer.latency(endpoint, started.elapsed());

        if result.is_err() {
            observer.error(endpoint);
        }
        result
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.gauges.close();
        self.inner.close().await
    }
}

/// Subscriber that counts, times and error-counts subscriptions.
pub struct StatsSubscriber {
    gauges: Gauges,
    inner: Box<dyn Subscriber>,
}

impl StatsSubscriber {
    /// Wraps `inner` and counts it as a live subscriber.
    pub fn new(
        observer: Arc<dyn Observe>,
        binding: &BindingConfiguration,
        inner: Box<dyn Subscriber>,
    ) -> Self {
        let endpoint = Endpoint::new(&binding.binder, &binding.destination, Direction::Subscriber);
        Self {
            gauges: Gauges::open(observer, endpoint),
            inner,
        }
    }
}

#[async_trait]
impl Subscriber for StatsSubscriber {
    async fn subscribe(
        &self,
        ctx: &Context,
        topic: &str,
    ) -> Result<mpsc::Receiver<Message>, BoxError> {
        let Gauges {
            endpoint, observer, ..
        } = &self.gauges;

        observer.subscription(endpoint);
        let started = Instant::now();
        let result = self.inner.subscribe(ctx, topic).await;
        observer.latency(endpoint, started.elapsed());

        if result.is_err() {
            observer.error(endpoint);
        }
        result
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.gauges.close();
        self.inner.close().await
    }
}

/// Counts, times and error-counts every call of `next`.
pub fn decorate(
    observer: Arc<dyn Observe>,
    binding: Arc<BindingConfiguration>,
    next: ListenerAction,
) -> ListenerAction {
    let endpoint = Arc::new(Endpoint::new(
        &binding.binder,
        &binding.destination,
        Direction::Subscriber,
    ));

    Arc::new(move |message: Message| {
        let observer = observer.clone();
        let endpoint = endpoint.clone();
        let next = next.clone();

        Box::pin(async move {
            observer.message(&endpoint);
            let started = Instant::now();
            let result = next(message).await;
            observer.latency(&endpoint, started.elapsed());

            if result.is_err() {
                observer.error(&endpoint);
            }
            result
        })
    })
}
