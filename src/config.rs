//! Worker configuration, read once at startup.

use crate::dispatch::DispatchRules;
use crate::error::ConfigError;
use crate::retry::{FailurePolicy, ReconnectPolicy};
use std::time::Duration;

pub const ENV_USER: &str = "AMQP_USER";
pub const ENV_PASS: &str = "AMQP_PASS";
pub const ENV_HOST: &str = "AMQP_HOST";
pub const ENV_QUEUE: &str = "AMQP_QUEUE";
pub const ENV_AUTODELETE: &str = "AMQP_AUTODELETE";
pub const ENV_MESSAGE_TTL: &str = "AMQP_MESSAGE_TTL";
pub const ENV_DEAD_LETTER: &str = "AMQP_DEAD_LETTER";
pub const ENV_CONSUMER_TAG: &str = "AMQP_CONSUMER_TAG";
pub const ENV_RECONNECT_ATTEMPTS: &str = "AMQP_RECONNECT_ATTEMPTS";
pub const ENV_RECONNECT_BASE_MS: &str = "AMQP_RECONNECT_BASE_MS";
pub const ENV_MAX_CONCURRENCY: &str = "WORKER_MAX_CONCURRENCY";
pub const ENV_DRAIN_TIMEOUT_MS: &str = "WORKER_DRAIN_TIMEOUT_MS";
pub const ENV_REPLY_TIMEOUT_MS: &str = "WORKER_REPLY_TIMEOUT_MS";
pub const ENV_FAILURE_POLICY: &str = "WORKER_FAILURE_POLICY";

/// Heartbeat requested from the broker, in seconds.
pub const HEARTBEAT_SECS: u16 = 60;

/// Configuration for a worker node.
///
/// Build it with [`WorkerConfig::from_env`] or [`WorkerConfig::builder`], then
/// hand it to `ServiceRuntime::new`, which validates it before any network
/// activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub user: String,
    pub password: String,
    /// Broker address, `amqp://host[:port][/vhost]` or a bare host name.
    pub host: String,
    /// The name of the queue to consume work packages from.
    pub queue_name: String,
    pub auto_delete: bool,
    /// Per-queue message TTL. Zero disables it.
    pub message_ttl: Duration,
    /// Maximum number of handler invocations running at once. Also used as
    /// the QoS prefetch count.
    pub max_concurrency: u16,
    pub drain_timeout: Duration,
    /// How long a finished handler waits for a usable channel to send its reply.
    pub reply_timeout: Duration,
    pub failure_policy: FailurePolicy,
    /// Declare `<queue>_dlx` / `<queue>_dlq` and route rejected messages there.
    pub dead_letter: bool,
    pub consumer_tag: String,
    pub reconnect: ReconnectPolicy,
}

/// Queue-level settings handed to the work channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub queue_name: String,
    pub consumer_tag: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub message_ttl: Duration,
    pub dead_letter: bool,
    pub prefetch_count: u16,
}

impl WorkerConfig {
    /// Creates a new `WorkerConfigBuilder` with the required connection fields.
    pub fn builder(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> WorkerConfigBuilder {
        WorkerConfigBuilder::new(host.into(), user.into(), password.into(), queue_name.into())
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name
    /// to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| lookup(key).ok_or(ConfigError::Missing(key));

        let user = required(ENV_USER)?;
        let password = required(ENV_PASS)?;
        let host = required(ENV_HOST)?;
        let queue_name = required(ENV_QUEUE)?;
        let auto_delete = parse_bool(ENV_AUTODELETE, &required(ENV_AUTODELETE)?)?;
        let message_ttl = parse_u64(ENV_MESSAGE_TTL, &required(ENV_MESSAGE_TTL)?)?;

        let mut builder = WorkerConfig::builder(host, user, password, queue_name)
            .auto_delete(auto_delete)
            .message_ttl(Duration::from_millis(message_ttl));

        if let Some(value) = lookup(ENV_MAX_CONCURRENCY) {
            let parsed = parse_u64(ENV_MAX_CONCURRENCY, &value)?;
            let max = u16::try_from(parsed).map_err(|_| ConfigError::Invalid {
                key: ENV_MAX_CONCURRENCY,
                value: value.clone(),
                reason: "must fit in 16 bits",
            })?;
            builder = builder.max_concurrency(max);
        }
        if let Some(value) = lookup(ENV_DRAIN_TIMEOUT_MS) {
            builder = builder.drain_timeout(Duration::from_millis(parse_u64(ENV_DRAIN_TIMEOUT_MS, &value)?));
        }
        if let Some(value) = lookup(ENV_REPLY_TIMEOUT_MS) {
            builder = builder.reply_timeout(Duration::from_millis(parse_u64(ENV_REPLY_TIMEOUT_MS, &value)?));
        }
        if let Some(value) = lookup(ENV_FAILURE_POLICY) {
            let policy = FailurePolicy::parse(&value).ok_or_else(|| ConfigError::Invalid {
                key: ENV_FAILURE_POLICY,
                value: value.clone(),
                reason: "expected 'requeue-once' or 'dead-letter'",
            })?;
            builder = builder.failure_policy(policy);
        }
        if let Some(value) = lookup(ENV_DEAD_LETTER) {
            builder = builder.dead_letter(parse_bool(ENV_DEAD_LETTER, &value)?);
        }
        if let Some(value) = lookup(ENV_CONSUMER_TAG) {
            builder = builder.consumer_tag(value);
        }

        let mut reconnect = ReconnectPolicy::default();
        if let Some(value) = lookup(ENV_RECONNECT_ATTEMPTS) {
            let attempts = parse_u64(ENV_RECONNECT_ATTEMPTS, &value)?;
            reconnect.max_attempts = u32::try_from(attempts).unwrap_or(u32::MAX);
        }
        if let Some(value) = lookup(ENV_RECONNECT_BASE_MS) {
            reconnect.base_delay = Duration::from_millis(parse_u64(ENV_RECONNECT_BASE_MS, &value)?);
        }

        let config = builder.reconnect_policy(reconnect).build();
        config.validate()?;
        Ok(config)
    }

    /// Checks that every required field is present and usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_empty = [
            (ENV_USER, &self.user),
            (ENV_PASS, &self.password),
            (ENV_HOST, &self.host),
            (ENV_QUEUE, &self.queue_name),
            (ENV_CONSUMER_TAG, &self.consumer_tag),
        ];
        for (key, value) in non_empty {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty(key));
            }
        }

        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: ENV_MAX_CONCURRENCY,
                value: "0".to_string(),
                reason: "must be a positive integer",
            });
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: ENV_RECONNECT_ATTEMPTS,
                value: "0".to_string(),
                reason: "at least one connection attempt is required",
            });
        }
        if u32::try_from(self.message_ttl.as_millis()).is_err() {
            return Err(ConfigError::Invalid {
                key: ENV_MESSAGE_TTL,
                value: self.message_ttl.as_millis().to_string(),
                reason: "exceeds the broker's 32-bit limit",
            });
        }
        Ok(())
    }

    /// Broker URI without credentials; those are applied separately.
    pub fn broker_url(&self) -> String {
        let host = self.host.trim();
        if host.contains("://") {
            host.to_string()
        } else {
            format!("amqp://{}", host)
        }
    }

    pub fn dispatch_rules(&self) -> DispatchRules {
        DispatchRules {
            failure_policy: self.failure_policy,
            dead_letter: self.dead_letter,
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            queue_name: self.queue_name.clone(),
            consumer_tag: self.consumer_tag.clone(),
            durable: true,
            auto_delete: self.auto_delete,
            message_ttl: self.message_ttl,
            dead_letter: self.dead_letter,
            prefetch_count: self.max_concurrency,
        }
    }
}

/// A builder for creating `WorkerConfig` instances.
pub struct WorkerConfigBuilder {
    host: String,
    user: String,
    password: String,
    queue_name: String,
    auto_delete: Option<bool>,
    message_ttl: Option<Duration>,
    max_concurrency: Option<u16>,
    drain_timeout: Option<Duration>,
    reply_timeout: Option<Duration>,
    failure_policy: Option<FailurePolicy>,
    dead_letter: Option<bool>,
    consumer_tag: Option<String>,
    reconnect: Option<ReconnectPolicy>,
}

impl WorkerConfigBuilder {
    fn new(host: String, user: String, password: String, queue_name: String) -> Self {
        Self {
            host,
            user,
            password,
            queue_name,
            auto_delete: None,
            message_ttl: None,
            max_concurrency: None,
            drain_timeout: None,
            reply_timeout: None,
            failure_policy: None,
            dead_letter: None,
            consumer_tag: None,
            reconnect: None,
        }
    }

    /// Defaults to `false`.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = Some(auto_delete);
        self
    }

    /// Defaults to zero (no TTL).
    pub fn message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Defaults to 4.
    pub fn max_concurrency(mut self, max: u16) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    /// Defaults to 30 seconds.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    /// Defaults to 30 seconds.
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    /// Defaults to [`FailurePolicy::RequeueOnce`].
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    /// Defaults to `true`.
    pub fn dead_letter(mut self, enabled: bool) -> Self {
        self.dead_letter = Some(enabled);
        self
    }

    /// Defaults to `{queue_name}_consumer`.
    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Builds the final `WorkerConfig`, applying defaults for any unset options.
    pub fn build(self) -> WorkerConfig {
        let queue_name = self.queue_name;
        WorkerConfig {
            consumer_tag: self.consumer_tag.unwrap_or_else(|| format!("{}_consumer", queue_name)),
            auto_delete: self.auto_delete.unwrap_or(false),
            message_ttl: self.message_ttl.unwrap_or(Duration::ZERO),
            max_concurrency: self.max_concurrency.unwrap_or(4),
            drain_timeout: self.drain_timeout.unwrap_or(Duration::from_secs(30)),
            reply_timeout: self.reply_timeout.unwrap_or(Duration::from_secs(30)),
            failure_policy: self.failure_policy.unwrap_or_default(),
            dead_letter: self.dead_letter.unwrap_or(true),
            reconnect: self.reconnect.unwrap_or_default(),
            queue_name,
            host: self.host,
            user: self.user,
            password: self.password,
        }
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        "" => Err(ConfigError::Empty(key)),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected 'true' or 'false'",
        }),
    }
}

fn parse_u64(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Empty(key));
    }
    trimmed.parse::<u64>().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: "expected a non-negative integer",
    })
}
