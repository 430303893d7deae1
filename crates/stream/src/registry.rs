use crate::config::{BindingConfiguration, StreamSettings};
use crate::error::{Error, Result};
use crate::observe::{NoopObserver, Observe};
use crate::provider::{Provider, Publisher, Subscriber};
use crate::stats::{StatsPublisher, StatsSubscriber};
use crate::trace::{LogTracer, TracePublisher, Tracer};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Binder name to provider map plus the settings bindings resolve against.
pub struct Registry {
    observer: Arc<dyn Observe>,
    providers: Mutex<HashMap<String, Arc<dyn Provider>>>,
    settings: StreamSettings,
    tracer: Arc<dyn Tracer>,
}

impl Registry {
    /// Creates an empty registry with no-op metrics and the log tracer.
    #[must_use]
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            observer: Arc::new(NoopObserver),
            providers: Mutex::new(HashMap::new()),
            settings,
            tracer: Arc::new(LogTracer),
        }
    }

    /// Replaces the metrics sink.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn Observe>) -> Self {
        self.observer = observer;
        self
    }

    /// Replaces the tracing backend.
    #[must_use]
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Registers `provider` as binder `name`, replacing any earlier one.
    pub fn register_provider(&self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        let name = name.into();
        debug!(binder = %name, "registering provider");
        self.providers.lock().insert(name, provider);
    }

    /// The settings bindings are resolved against.
    #[must_use]
    pub const fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// The metrics sink.
    #[must_use]
    pub fn observer(&self) -> Arc<dyn Observe> {
        self.observer.clone()
    }

    /// The tracing backend.
    #[must_use]
    pub fn tracer(&self) -> Arc<dyn Tracer> {
        self.tracer.clone()
    }

    /// Resolves the configuration of binding `name`.
    ///
    /// # Errors
    /// See [`BindingConfiguration::resolve`].
    pub fn binding_configuration(&self, name: &str) -> Result<BindingConfiguration> {
        self.settings.binding(name)
    }

    fn provider(&self, name: &str, binding: &BindingConfiguration) -> Result<Arc<dyn Provider>> {
        self.providers
            .lock()
            .get(&binding.binder)
            .cloned()
            .ok_or_else(|| Error::BinderNotEnabled {
                binding: name.to_string(),
                binder: binding.binder.clone(),
            })
    }

    /// Creates a traced, metered publisher for binding `name`.
    ///
    /// # Errors
    /// Configuration errors, [`Error::BinderNotEnabled`] and
    /// [`Error::Provider`].
    pub async fn new_publisher(&self, name: &str) -> Result<Box<dyn Publisher>> {
        let binding = self.binding_configuration(name)?;
        self.publisher_for(name, &binding).await
    }

    pub(crate) async fn publisher_for(
        &self,
        name: &str,
        binding: &BindingConfiguration,
    ) -> Result<Box<dyn Publisher>> {
        let provider = self.provider(name, binding)?;

        let raw = provider
            .new_publisher(&self.settings, name, binding)
            .await
            .map_err(|source| Error::Provider {
                binding: name.to_string(),
                binder: binding.binder.clone(),
                role: "publisher",
                source,
            })?;

        let traced = TracePublisher::new(self.tracer.clone(), binding, raw);
        Ok(Box::new(StatsPublisher::new(
            self.observer.clone(),
            binding,
            Box::new(traced),
        )))
    }

    /// Creates a metered subscriber for binding `name`.
    ///
    /// # Errors
    /// Configuration errors, [`Error::BinderNotEnabled`],
    /// [`Error::ConsumerNotEnabled`] and [`Error::Provider`].
    pub async fn new_subscriber(&self, name: &str) -> Result<Box<dyn Subscriber>> {
        let binding = self.binding_configuration(name)?;
        self.subscriber_for(name, &binding).await
    }

    pub(crate) async fn subscriber_for(
        &self,
        name: &str,
        binding: &BindingConfiguration,
    ) -> Result<Box<dyn Subscriber>> {
        let provider = self.provider(name, binding)?;

        if !binding.consumer.auto_startup {
            return Err(Error::ConsumerNotEnabled(name.to_string()));
        }

        let raw = provider
            .new_subscriber(&self.settings, name, binding)
            .await
            .map_err(|source| Error::Provider {
                binding: name.to_string(),
                binder: binding.binder.clone(),
                role: "subscriber",
                source,
            })?;

        Ok(Box::new(StatsSubscriber::new(
            self.observer.clone(),
            binding,
            raw,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::action::BoxError;

    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    #[derive(Default)]
    struct CountingProvider {
        subscribers: AtomicU32,
    }

    #[async_trait]
    impl Provider for CountingProvider {
        async fn new_publisher(
            &self,
            _settings: &StreamSettings,
            _name: &str,
            _binding: &BindingConfiguration,
        ) -> std::result::Result<Box<dyn Publisher>, BoxError> {
            Err("publishers unsupported".into())
        }

        async fn new_subscriber(
            &self,
            _settings: &StreamSettings,
            _name: &str,
            _binding: &BindingConfiguration,
        ) -> std::result::Result<Box<dyn Subscriber>, BoxError> {
            self.subscribers.fetch_add(1, Ordering::SeqCst);
            Err("subscribers unsupported".into())
        }
    }

    fn registry(document: &str) -> Registry {
        Registry::new(StreamSettings::from_toml_str(document).unwrap())
    }

    #[tokio::test]
    async fn test_unknown_binder() {
        let registry = registry(r#"application-name = "svc""#);

        let result = registry.new_publisher("orders").await;

        assert!(matches!(
            result,
            Err(Error::BinderNotEnabled { binder, .. }) if binder == "kafka"
        ));
    }

    #[tokio::test]
    async fn test_disabled_consumer_never_reaches_provider() {
        let registry = registry(
            r#"
            application-name = "svc"
            [bindings.orders]
            binder = "counting"
            [bindings.orders.consumer]
            auto-startup = false
            "#,
        );
        let provider = Arc::new(CountingProvider::default());
        registry.register_provider("counting", provider.clone());

        let result = registry.new_subscriber("orders").await;

        assert!(matches!(result, Err(Error::ConsumerNotEnabled(name)) if name == "orders"));
        assert_eq!(provider.subscribers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_provider_errors_are_wrapped() {
        let registry = registry(
            r#"
            application-name = "svc"
            [bindings.orders]
            binder = "counting"
            "#,
        );
        registry.register_provider("counting", Arc::new(CountingProvider::default()));

        let publisher = registry.new_publisher("orders").await;
        let subscriber = registry.new_subscriber("orders").await;

        assert!(matches!(publisher, Err(Error::Provider { role: "publisher", .. })));
        assert!(matches!(subscriber, Err(Error::Provider { role: "subscriber", .. })));
    }

    #[tokio::test]
    async fn test_registration_is_last_writer_wins() {
        let registry = registry(
            r#"
            application-name = "svc"
            [bindings.orders]
            binder = "counting"
            "#,
        );
        let first = Arc::new(CountingProvider::default());
        let second = Arc::new(CountingProvider::default());
        registry.register_provider("counting", first.clone());
        registry.register_provider("counting", second.clone());

        let _ = registry.new_subscriber("orders").await;

        assert_eq!(first.subscribers.load(Ordering::SeqCst), 0);
        assert_eq!(second.subscribers.load(Ordering::SeqCst), 1);
    }
}
