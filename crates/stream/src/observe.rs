//! Metric sinks for publishers, subscribers and handlers.

use crate::error::Result;

use std::fmt::{self, Debug, Display};
use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};

/// Which side of a binding an endpoint is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Outbound.
    Publisher,
    /// Inbound.
    Subscriber,
}

impl Direction {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Publisher => "publisher",
            Self::Subscriber => "subscriber",
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Labels shared by every endpoint metric.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Provider name.
    pub binder: String,
    /// Transport topic.
    pub destination: String,
    /// Publisher or subscriber.
    pub direction: Direction,
}

impl Endpoint {
    /// Creates endpoint labels.
    pub fn new(binder: impl Into<String>, destination: impl Into<String>, direction: Direction) -> Self {
        Self {
            binder: binder.into(),
            destination: destination.into(),
            direction,
        }
    }
}

/// Narrow metrics sink.
pub trait Observe: Debug + Send + Sync {
    /// Adjusts the live connection count of a binder.
    fn connections(&self, binder: &str, delta: i64);

    /// Adjusts the live publisher or subscriber count of an endpoint.
    fn endpoints(&self, endpoint: &Endpoint, delta: i64);

    /// Counts one message.
    fn message(&self, endpoint: &Endpoint);

    /// Counts one subscribe call.
    fn subscription(&self, endpoint: &Endpoint);

    /// Counts one failure.
    fn error(&self, endpoint: &Endpoint);

    /// Records how long handling or sending a message took.
    fn latency(&self, endpoint: &Endpoint, elapsed: Duration);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl Observe for NoopObserver {
    fn connections(&self, _binder: &str, _delta: i64) {}

    fn endpoints(&self, _endpoint: &Endpoint, _delta: i64) {}

    fn message(&self, _endpoint: &Endpoint) {}

    fn subscription(&self, _endpoint: &Endpoint) {}

    fn error(&self, _endpoint: &Endpoint) {}

    fn latency(&self, _endpoint: &Endpoint, _elapsed: Duration) {}
}

const ENDPOINT_LABELS: &[&str] = &["binder", "destination", "direction"];

/// Prometheus-backed sink.
#[derive(Debug)]
pub struct PrometheusObserver {
    connections: IntGaugeVec,
    endpoints: IntGaugeVec,
    messages: IntCounterVec,
    subscriptions: IntCounterVec,
    errors: IntCounterVec,
    duration: HistogramVec,
}

impl PrometheusObserver {
    /// Creates the metric families and registers them with `registry`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Metrics`] if a family is already registered.
    pub fn new(registry: &Registry) -> Result<Self> {
        let connections = IntGaugeVec::new(
            Opts::new("stream_connections", "Live transport connections"),
            &["binder"],
        )?;
        registry.register(Box::new(connections.clone()))?;

        let endpoints = IntGaugeVec::new(
            Opts::new("stream_endpoints", "Live publishers and subscribers"),
            ENDPOINT_LABELS,
        )?;
        registry.register(Box::new(endpoints.clone()))?;

        let messages = IntCounterVec::new(
            Opts::new("stream_messages_total", "Messages sent or handled"),
            ENDPOINT_LABELS,
        )?;
        registry.register(Box::new(messages.clone()))?;

        let subscriptions = IntCounterVec::new(
            Opts::new("stream_subscriptions_total", "Subscribe calls"),
            ENDPOINT_LABELS,
        )?;
        registry.register(Box::new(subscriptions.clone()))?;

        let errors = IntCounterVec::new(
            Opts::new("stream_message_errors_total", "Failed sends, subscribes and handlers"),
            ENDPOINT_LABELS,
        )?;
        registry.register(Box::new(errors.clone()))?;

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "stream_message_duration_seconds",
                "Time spent sending or handling a message",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            ENDPOINT_LABELS,
        )?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            connections,
            endpoints,
            messages,
            subscriptions,
            errors,
            duration,
        })
    }
}

fn labels(endpoint: &Endpoint) -> [&str; 3] {
    [
        &endpoint.binder,
        &endpoint.destination,
        endpoint.direction.as_str(),
    ]
}

impl Observe for PrometheusObserver {
    fn connections(&self, binder: &str, delta: i64) {
        self.connections.with_label_values(&[binder]).add(delta);
    }

    fn endpoints(&self, endpoint: &Endpoint, delta: i64) {
        self.endpoints.with_label_values(&labels(endpoint)).add(delta);
    }

    fn message(&self, endpoint: &Endpoint) {
        self.messages.with_label_values(&labels(endpoint)).inc();
    }

    fn subscription(&self, endpoint: &Endpoint) {
        self.subscriptions.with_label_values(&labels(endpoint)).inc();
    }

    fn error(&self, endpoint: &Endpoint) {
        self.errors.with_label_values(&labels(endpoint)).inc();
    }

    fn latency(&self, endpoint: &Endpoint, elapsed: Duration) {
        self.duration
            .with_label_values(&labels(endpoint))
            .observe(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_observer_records_by_endpoint() {
        let registry = Registry::new();
        let observer = PrometheusObserver::new(&registry).unwrap();
        let endpoint = Endpoint::new("kafka", "orders", Direction::Subscriber);

        observer.connections("kafka", 1);
        observer.endpoints(&endpoint, 1);
        observer.message(&endpoint);
        observer.message(&endpoint);
        observer.subscription(&endpoint);
        observer.error(&endpoint);
        observer.latency(&endpoint, Duration::from_millis(3));

        let labels = ["kafka", "orders", "subscriber"];
        assert_eq!(observer.connections.with_label_values(&["kafka"]).get(), 1);
        assert_eq!(observer.endpoints.with_label_values(&labels).get(), 1);
        assert_eq!(observer.messages.with_label_values(&labels).get(), 2);
        assert_eq!(observer.subscriptions.with_label_values(&labels).get(), 1);
        assert_eq!(observer.errors.with_label_values(&labels).get(), 1);
        assert_eq!(
            observer.duration.with_label_values(&labels).get_sample_count(),
            1
        );
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        PrometheusObserver::new(&registry).unwrap();

        assert!(PrometheusObserver::new(&registry).is_err());
    }
}
