//! Binding configuration.
//!
//! [`StreamSettings`] is the already-loaded configuration document. Each
//! binding resolves into an immutable [`BindingConfiguration`] by layering the
//! binding's own values over the workspace-wide defaults and the hard defaults.

use crate::error::{Error, Result};

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_BINDER: &str = "kafka";
const DEFAULT_CONTENT_TYPE: &str = "application/json";
const DEFAULT_HEADER_MODE: &str = "none";
const GROUP_SUFFIX: &str = "_GP";
const SERVICE_SUFFIX: &str = "SERVICE";

/// Retry values as written in settings. Unset fields fall through to defaults.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetrySettings {
    /// Total number of attempts.
    pub attempts: Option<u32>,
    /// Delay before the second attempt, in milliseconds.
    pub delay: Option<u64>,
    /// Delay multiplier applied after each failed attempt.
    pub backoff: Option<f64>,
    /// Keep the delay constant instead of multiplying it.
    pub linear: Option<bool>,
}

/// Consumer values as written in settings.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConsumerSettings {
    /// Subscribe the binding when the router starts.
    pub auto_startup: Option<bool>,
    /// Requested consumer concurrency.
    pub concurrency: Option<u32>,
    /// Whether the consumer reads partitioned data.
    pub partitioned: Option<bool>,
    /// Header handling mode.
    pub header_mode: Option<String>,
    /// Transport-side delivery attempts.
    pub max_attempts: Option<u32>,
    /// Milliseconds.
    pub backoff_initial_interval: Option<u64>,
    /// Milliseconds.
    pub backoff_max_interval: Option<u64>,
    /// Transport-side backoff multiplier.
    pub backoff_multiplier: Option<f64>,
    /// Whether unclassified errors are retryable.
    pub default_retryable: Option<bool>,
    /// Index of this instance among the consumers.
    pub instance_index: Option<i32>,
    /// Number of consumer instances.
    pub instance_count: Option<i32>,
}

/// Per-binding values as written in settings.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BindingSettings {
    /// Transport topic.
    pub destination: Option<String>,
    /// Consumer group id.
    pub group: Option<String>,
    /// Payload content type.
    pub content_type: Option<String>,
    /// Provider name.
    pub binder: Option<String>,
    /// Binding id.
    pub binding_id: Option<String>,
    /// Log received payloads.
    pub log_messages: Option<bool>,
    /// Retry overrides.
    pub retry: RetrySettings,
    /// Consumer overrides.
    pub consumer: ConsumerSettings,
}

/// The loaded stream configuration document.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StreamSettings {
    /// Used to derive consumer groups.
    pub application_name: Option<String>,
    /// Default binding id.
    pub application_instance: Option<String>,
    /// Consumer defaults shared by every binding.
    pub default_consumer: ConsumerSettings,
    /// Retry defaults shared by every binding.
    pub default_retry: RetrySettings,
    /// Settings keyed by binding name.
    pub bindings: HashMap<String, BindingSettings>,
}

impl StreamSettings {
    /// Parses settings from a TOML document.
    ///
    /// # Errors
    /// Returns [`Error::InvalidSettings`] if the document is malformed.
    pub fn from_toml_str(document: &str) -> Result<Self> {
        Ok(toml::from_str(document)?)
    }

    /// Resolves the configuration of the named binding.
    ///
    /// # Errors
    /// See [`BindingConfiguration::resolve`].
    pub fn binding(&self, key: &str) -> Result<BindingConfiguration> {
        BindingConfiguration::resolve(self, key)
    }
}

/// Resolved retry policy for a binding.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, at least one.
    pub attempts: u32,
    /// Delay before the second attempt.
    pub delay: Duration,
    /// Multiplier applied to the delay after each failure unless `linear`.
    pub backoff: f64,
    /// Keep the delay constant.
    pub linear: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
            backoff: 0.0,
            linear: true,
        }
    }
}

impl RetryConfig {
    fn layered(binding: &RetrySettings, defaults: &RetrySettings) -> Self {
        let fallback = Self::default();
        Self {
            attempts: binding
                .attempts
                .or(defaults.attempts)
                .unwrap_or(fallback.attempts),
            delay: binding
                .delay
                .or(defaults.delay)
                .map_or(fallback.delay, Duration::from_millis),
            backoff: binding
                .backoff
                .or(defaults.backoff)
                .unwrap_or(fallback.backoff),
            linear: binding.linear.or(defaults.linear).unwrap_or(fallback.linear),
        }
    }

    fn validate(&self, binding: &str) -> Result<()> {
        let reason = if self.attempts < 1 {
            "attempts must be at least 1"
        } else if !self.backoff.is_finite() || self.backoff < 0.0 {
            "backoff must be a finite, non-negative number"
        } else {
            return Ok(());
        };

        Err(Error::InvalidRetryPolicy {
            binding: binding.to_string(),
            reason: reason.to_string(),
        })
    }
}

/// Resolved consumer policy for a binding.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumerConfiguration {
    /// Disabled consumers are never subscribed.
    pub auto_startup: bool,
    /// Requested consumer concurrency. Dispatch stays sequential.
    pub concurrency: u32,
    /// Whether the consumer reads partitioned data.
    pub partitioned: bool,
    /// Header handling mode.
    pub header_mode: String,
    /// Transport-side delivery attempts.
    pub max_attempts: u32,
    /// Transport-side initial backoff.
    pub backoff_initial_interval: Duration,
    /// Transport-side backoff ceiling.
    pub backoff_max_interval: Duration,
    /// Transport-side backoff multiplier.
    pub backoff_multiplier: f64,
    /// Whether unclassified errors are retryable.
    pub default_retryable: bool,
    /// Index of this instance, `-1` when unset.
    pub instance_index: i32,
    /// Number of instances, `-1` when unset.
    pub instance_count: i32,
}

impl Default for ConsumerConfiguration {
    fn default() -> Self {
        Self {
            auto_startup: true,
            concurrency: 1,
            partitioned: false,
            header_mode: DEFAULT_HEADER_MODE.to_string(),
            max_attempts: 3,
            backoff_initial_interval: Duration::from_millis(1000),
            backoff_max_interval: Duration::from_millis(10000),
            backoff_multiplier: 2.0,
            default_retryable: true,
            instance_index: -1,
            instance_count: -1,
        }
    }
}

impl ConsumerConfiguration {
    fn layered(binding: &ConsumerSettings, defaults: &ConsumerSettings) -> Self {
        let fallback = Self::default();
        let millis = |b: Option<u64>, d: Option<u64>, f: Duration| {
            b.or(d).map_or(f, Duration::from_millis)
        };

        Self {
            auto_startup: binding
                .auto_startup
                .or(defaults.auto_startup)
                .unwrap_or(fallback.auto_startup),
            concurrency: binding
                .concurrency
                .or(defaults.concurrency)
                .unwrap_or(fallback.concurrency),
            partitioned: binding
                .partitioned
                .or(defaults.partitioned)
                .unwrap_or(fallback.partitioned),
            header_mode: binding
                .header_mode
                .clone()
                .or_else(|| defaults.header_mode.clone())
                .unwrap_or(fallback.header_mode),
            max_attempts: binding
                .max_attempts
                .or(defaults.max_attempts)
                .unwrap_or(fallback.max_attempts),
            backoff_initial_interval: millis(
                binding.backoff_initial_interval,
                defaults.backoff_initial_interval,
                fallback.backoff_initial_interval,
            ),
            backoff_max_interval: millis(
                binding.backoff_max_interval,
                defaults.backoff_max_interval,
                fallback.backoff_max_interval,
            ),
            backoff_multiplier: binding
                .backoff_multiplier
                .or(defaults.backoff_multiplier)
                .unwrap_or(fallback.backoff_multiplier),
            default_retryable: binding
                .default_retryable
                .or(defaults.default_retryable)
                .unwrap_or(fallback.default_retryable),
            instance_index: binding
                .instance_index
                .or(defaults.instance_index)
                .unwrap_or(fallback.instance_index),
            instance_count: binding
                .instance_count
                .or(defaults.instance_count)
                .unwrap_or(fallback.instance_count),
        }
    }
}

/// Resolved, immutable settings of one binding.
#[derive(Clone, Debug, PartialEq)]
pub struct BindingConfiguration {
    /// Transport topic; defaults to the binding key.
    pub destination: String,
    /// Consumer group id, always prefixed with `<binding key>-`.
    pub group: String,
    /// Payload content type.
    pub content_type: String,
    /// Provider name.
    pub binder: String,
    /// Binding id; defaults to the application instance.
    pub binding_id: String,
    /// Log received payloads.
    pub log_messages: bool,
    /// Handler retry policy.
    pub retry: RetryConfig,
    /// Consumer policy.
    pub consumer: ConsumerConfiguration,
}

impl BindingConfiguration {
    /// Resolves the configuration of the binding `key`.
    ///
    /// # Errors
    /// - [`Error::TopicNotSpecified`] if `key` is empty.
    /// - [`Error::ApplicationNameNotConfigured`] if no group is configured and
    ///   none can be derived.
    /// - [`Error::InvalidRetryPolicy`] if the retry policy is malformed.
    pub fn resolve(settings: &StreamSettings, key: &str) -> Result<Self> {
        if key.is_empty() {
            return Err(Error::TopicNotSpecified);
        }

        let binding = settings.bindings.get(key).cloned().unwrap_or_default();

        let group = match binding.group.filter(|group| !group.is_empty()) {
            Some(group) => group,
            None => derive_group(settings.application_name.as_deref())
                .ok_or_else(|| Error::ApplicationNameNotConfigured(key.to_string()))?,
        };

        let retry = RetryConfig::layered(&binding.retry, &settings.default_retry);
        retry.validate(key)?;

        Ok(Self {
            destination: binding
                .destination
                .filter(|destination| !destination.is_empty())
                .unwrap_or_else(|| key.to_string()),
            group: format!("{key}-{group}"),
            content_type: binding
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            binder: binding
                .binder
                .unwrap_or_else(|| DEFAULT_BINDER.to_string()),
            binding_id: binding
                .binding_id
                .or_else(|| settings.application_instance.clone())
                .unwrap_or_default(),
            log_messages: binding.log_messages.unwrap_or(true),
            retry,
            consumer: ConsumerConfiguration::layered(&binding.consumer, &settings.default_consumer),
        })
    }
}

fn derive_group(application_name: Option<&str>) -> Option<String> {
    let name = application_name.filter(|name| !name.is_empty())?.to_uppercase();
    let base = name.strip_suffix(SERVICE_SUFFIX).unwrap_or(&name);
    Some(format!("{base}{GROUP_SUFFIX}"))
}
