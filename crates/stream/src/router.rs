//! Listener registration and per-topic dispatch.
//!
//! Listeners are registered while the router is [`RouterState::Registering`].
//! [`Router::start`] seals the listener map, subscribes every listener to its
//! binding's destination and spawns one dispatch task per listener. Messages
//! of one listener are handled strictly one after another and acknowledged
//! once the decorated handler returns, whatever the outcome.

use crate::action::ListenerAction;
use crate::config::BindingConfiguration;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::provider::Subscriber;
use crate::registry::Registry;
use crate::{recover, retry, stats, trace};

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// How long [`Router::stop`] waits for dispatch tasks by default.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle of a [`Router`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouterState {
    /// Accepting listeners.
    Registering,
    /// Dispatching messages.
    Running,
    /// Shut down. Terminal.
    Stopped,
}

#[derive(Default)]
struct Listeners {
    sealed: bool,
    topics: IndexMap<String, Vec<ListenerAction>>,
}

/// Subscribes listeners to their bindings and dispatches inbound messages.
pub struct Router {
    close_timeout: Duration,
    handler_seq: AtomicU32,
    listeners: Mutex<Listeners>,
    registry: Arc<Registry>,
    shutdown: Mutex<Context>,
    state: tokio::sync::Mutex<RouterState>,
    subscribers: Mutex<Vec<Box<dyn Subscriber>>>,
    task_tracker: TaskTracker,
}

impl Router {
    /// Creates a router resolving bindings through `registry`.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            handler_seq: AtomicU32::new(0),
            listeners: Mutex::new(Listeners::default()),
            registry,
            shutdown: Mutex::new(Context::background()),
            state: tokio::sync::Mutex::new(RouterState::Registering),
            subscribers: Mutex::new(Vec::new()),
            task_tracker: TaskTracker::new(),
        }
    }

    /// Bounds how long [`Router::stop`] waits for in-flight handlers.
    #[must_use]
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Registers `action` for messages of binding `topic`.
    ///
    /// # Errors
    /// [`Error::TopicNotSpecified`] for an empty topic and
    /// [`Error::RouterRunning`] once the router has been started.
    pub fn add_listener(&self, topic: impl Into<String>, action: ListenerAction) -> Result<()> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(Error::TopicNotSpecified);
        }

        let mut listeners = self.listeners.lock();
        if listeners.sealed {
            return Err(Error::RouterRunning);
        }

        debug!(topic = %topic, "adding listener");
        listeners.topics.entry(topic).or_default().push(action);
        Ok(())
    }

    /// Number of registered listeners across all topics.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().topics.values().map(Vec::len).sum()
    }

    /// The current lifecycle state.
    pub async fn state(&self) -> RouterState {
        *self.state.lock().await
    }

    /// Subscribes every listener and starts dispatching.
    ///
    /// Listeners whose binder is not registered or whose consumer is disabled
    /// are skipped. Any other failure stops everything already started.
    ///
    /// # Errors
    /// [`Error::AlreadyStarted`] unless the router is registering, otherwise
    /// the first configuration, provider or subscribe error.
    pub async fn start(&self, ctx: &Context) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state != RouterState::Registering {
            return Err(Error::AlreadyStarted);
        }

        let topics = {
            let mut listeners = self.listeners.lock();
            listeners.sealed = true;
            listeners.topics.clone()
        };

        let shutdown = ctx.child();
        *self.shutdown.lock() = shutdown.clone();

        info!("starting router");
        match self.spawn_listeners(&shutdown, topics).await {
            Ok(0) => {
                warn!("no listeners registered, router disabled");
            }
            Ok(handlers) => {
                info!(handlers, "router started");
            }
            Err(err) => {
                error!(error = %err, "router failed to start");
                self.shutdown_tasks().await;
                *state = RouterState::Stopped;
                return Err(err);
            }
        }

        self.task_tracker.close();
        *state = RouterState::Running;
        Ok(())
    }

    async fn spawn_listeners(
        &self,
        shutdown: &Context,
        topics: IndexMap<String, Vec<ListenerAction>>,
    ) -> Result<usize> {
        let mut spawned = 0;

        for (topic, actions) in topics {
            for action in actions {
                let binding = self.registry.binding_configuration(&topic)?;

                let subscriber = match self.registry.subscriber_for(&topic, &binding).await {
                    Ok(subscriber) => subscriber,
                    Err(err @ (Error::BinderNotEnabled { .. } | Error::ConsumerNotEnabled(_))) => {
                        warn!(topic = %topic, error = %err, "skipping listener");
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                let binding = Arc::new(binding);
                let handler = self.compose(&binding, action);

                let receiver = subscriber.subscribe(shutdown, &binding.destination).await;
                self.subscribers.lock().push(subscriber);
                let receiver = receiver.map_err(|source| Error::Subscribe {
                    destination: binding.destination.clone(),
                    source,
                })?;

                let seq = self.handler_seq.fetch_add(1, Ordering::Relaxed) + 1;
                let name = format!("{topic}-{seq}");
                let span = info_span!("handler", name = %name, topic = %topic);

                info!(
                    handler = %name,
                    binder = %binding.binder,
                    destination = %binding.destination,
                    group = %binding.group,
                    "listener subscribed"
                );

                self.task_tracker.spawn(
                    process_messages(binding, handler, receiver, shutdown.clone()).instrument(span),
                );
                spawned += 1;
            }
        }

        Ok(spawned)
    }

    /// Wraps `action` in trace, stats, retry and panic recovery, outermost first.
    fn compose(&self, binding: &Arc<BindingConfiguration>, action: ListenerAction) -> ListenerAction {
        let recovered = recover::decorate(binding.clone(), action);
        let retried = retry::decorate(binding.clone(), recovered);
        let metered = stats::decorate(self.registry.observer(), binding.clone(), retried);
        trace::decorate(self.registry.tracer(), binding.clone(), metered)
    }

    /// Stops dispatching and closes every subscriber.
    ///
    /// Handlers still running after the close timeout are left behind and the
    /// subscribers are closed anyway. Safe to call more than once, and before
    /// [`Router::start`].
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if *state == RouterState::Stopped {
            return;
        }

        info!("stopping router");
        self.listeners.lock().sealed = true;
        self.shutdown_tasks().await;
        *state = RouterState::Stopped;
        info!("router stopped");
    }

    async fn shutdown_tasks(&self) {
        self.shutdown.lock().cancel();
        self.task_tracker.close();
        if tokio::time::timeout(self.close_timeout, self.task_tracker.wait())
            .await
            .is_err()
        {
            warn!(
                timeout = ?self.close_timeout,
                tasks = self.task_tracker.len(),
                "dispatch tasks did not finish before close timeout"
            );
        }

        let subscribers = std::mem::take(&mut *self.subscribers.lock());
        for subscriber in subscribers {
            if let Err(err) = subscriber.close().await {
                warn!(error = %err, "failed to close subscriber");
            }
        }
    }

    /// Resolves once every dispatch task has exited.
    pub async fn wait(&self) {
        self.task_tracker.wait().await;
    }
}

async fn process_messages(
    binding: Arc<BindingConfiguration>,
    handler: ListenerAction,
    mut receiver: mpsc::Receiver<Message>,
    shutdown: Context,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                debug!("dispatch cancelled");
                break;
            }
            message = receiver.recv() => {
                let Some(message) = message else {
                    if !shutdown.is_cancelled() {
                        error!(destination = %binding.destination, "subscription closed unexpectedly");
                    }
                    break;
                };

                let message = message.with_context(shutdown.child());
                if binding.log_messages {
                    info!(
                        message_id = %message.id(),
                        payload = %String::from_utf8_lossy(message.payload()),
                        "message received"
                    );
                } else {
                    info!(message_id = %message.id(), payload = "payload hidden", "message received");
                }

                if let Err(err) = handler(message.clone()).await {
                    error!(message_id = %message.id(), error = %err, "handler failed");
                }
                message.ack();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::action::action;
    use crate::config::StreamSettings;

    use tracing_test::traced_test;

    fn router() -> Router {
        let settings = StreamSettings {
            application_name: Some("svc".to_string()),
            ..StreamSettings::default()
        };
        Router::new(Arc::new(Registry::new(settings)))
    }

    fn noop() -> ListenerAction {
        action(|_message: Message| async { Ok(()) })
    }

    #[test]
    fn test_empty_topic_is_rejected() {
        assert!(matches!(
            router().add_listener("", noop()),
            Err(Error::TopicNotSpecified)
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_start_without_listeners_runs_disabled() {
        let router = router();

        router.start(&Context::background()).await.unwrap();

        assert_eq!(router.state().await, RouterState::Running);
        assert!(logs_contain("router disabled"));
        router.wait().await;
    }

    #[tokio::test]
    async fn test_listeners_without_binder_are_skipped() {
        let router = router();
        router.add_listener("orders", noop()).unwrap();

        router.start(&Context::background()).await.unwrap();

        assert_eq!(router.state().await, RouterState::Running);
        router.stop().await;
    }

    #[tokio::test]
    async fn test_add_listener_after_start_is_rejected() {
        let router = router();
        router.add_listener("orders", noop()).unwrap();
        router.start(&Context::background()).await.unwrap();

        assert!(matches!(
            router.add_listener("orders", noop()),
            Err(Error::RouterRunning)
        ));
        assert_eq!(router.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let router = router();
        router.start(&Context::background()).await.unwrap();

        assert!(matches!(
            router.start(&Context::background()).await,
            Err(Error::AlreadyStarted)
        ));
    }

    #[test]
    fn test_close_timeout_is_configurable() {
        assert_eq!(router().close_timeout, DEFAULT_CLOSE_TIMEOUT);
        assert_eq!(
            router()
                .with_close_timeout(Duration::from_secs(1))
                .close_timeout,
            Duration::from_secs(1)
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_terminal() {
        let router = router();

        router.stop().await;
        router.stop().await;

        assert_eq!(router.state().await, RouterState::Stopped);
        assert!(matches!(
            router.start(&Context::background()).await,
            Err(Error::AlreadyStarted)
        ));
        assert!(matches!(
            router.add_listener("orders", noop()),
            Err(Error::RouterRunning)
        ));
    }
}
