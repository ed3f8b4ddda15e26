//! Service configuration.
//!
//! Settings come from environment variables by default. With `--config`,
//! a YAML file is read instead; `${VAR}` references in it are expanded
//! before parsing. Either way the result is validated once at startup and
//! never reloaded.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::debug;

use tally_core::config::{EnvReader, interpolate, is_yaml_file};
use tally_core::error::{ReadFileSnafu, UnsupportedFormatSnafu, YamlParseSnafu};
use tally_core::{ConfigError, ExponentialBackoff, ServerConfig};

use crate::queue::ReceiveOptions;
use crate::store::RedisStoreConfig;

/// Longest visibility timeout the queue service accepts (12 hours).
const MAX_VISIBILITY_TIMEOUT_SECS: u32 = 43_200;
/// Longest long-poll wait the queue service accepts.
const MAX_WAIT_TIME_SECS: u32 = 20;
/// Most messages one receive call can return.
const MAX_BATCH_SIZE: u32 = 10;

/// Queue and dead-letter queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    pub name: String,
    /// Defaults to `{name}-dlq`.
    pub dlq_name: Option<String>,
    pub visibility_timeout_secs: u32,
    /// Receives allowed before the queue service moves a message to the DLQ.
    pub max_receive_count: u32,
    pub wait_time_secs: u32,
    /// Custom endpoint, e.g. LocalStack.
    pub endpoint_url: Option<String>,
    pub region: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "tally-events".to_string(),
            dlq_name: None,
            visibility_timeout_secs: 300,
            max_receive_count: 3,
            wait_time_secs: 20,
            endpoint_url: None,
            region: "us-east-1".to_string(),
        }
    }
}

impl QueueConfig {
    pub fn dlq_name(&self) -> String {
        self.dlq_name
            .clone()
            .unwrap_or_else(|| format!("{}-dlq", self.name))
    }

    fn from_env(env: &mut EnvReader) -> Self {
        let defaults = Self::default();
        Self {
            name: env.string("SQS_QUEUE_NAME", defaults.name),
            dlq_name: env.optional("DLQ_QUEUE_NAME"),
            visibility_timeout_secs: env
                .parse("SQS_VISIBILITY_TIMEOUT", defaults.visibility_timeout_secs),
            max_receive_count: env.parse("SQS_MAX_RECEIVE_COUNT", defaults.max_receive_count),
            wait_time_secs: env.parse("SQS_WAIT_TIME_SECONDS", defaults.wait_time_secs),
            endpoint_url: env.optional("AWS_ENDPOINT_URL"),
            region: env.string("AWS_DEFAULT_REGION", defaults.region),
        }
    }
}

/// Processing loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessorConfig {
    /// Messages requested per receive (1..=10).
    pub batch_size: u32,
    /// Sleep after a cycle that processed nothing.
    pub idle_sleep_secs: u64,
    /// Deliveries with a receive count above this get a fresh visibility window.
    pub visibility_extension_threshold: u32,
    /// How often the DLQ depth is sampled while idle; 0 disables.
    pub dlq_check_interval_secs: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            idle_sleep_secs: 1,
            visibility_extension_threshold: 1,
            dlq_check_interval_secs: 60,
        }
    }
}

impl ProcessorConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_secs(self.idle_sleep_secs)
    }

    pub fn dlq_check_interval(&self) -> Option<Duration> {
        (self.dlq_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.dlq_check_interval_secs))
    }

    fn from_env(env: &mut EnvReader) -> Self {
        let defaults = Self::default();
        Self {
            batch_size: env.parse("MAX_MESSAGES_PER_BATCH", defaults.batch_size),
            idle_sleep_secs: env.parse("PROCESSOR_SLEEP_INTERVAL", defaults.idle_sleep_secs),
            visibility_extension_threshold: env.parse(
                "VISIBILITY_EXTENSION_THRESHOLD",
                defaults.visibility_extension_threshold,
            ),
            dlq_check_interval_secs: env
                .parse("DLQ_CHECK_INTERVAL", defaults.dlq_check_interval_secs),
        }
    }
}

/// Aggregate store connection and startup retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub key_prefix: String,
    /// Pings attempted before startup gives up.
    pub connect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "redis".to_string(),
            port: 6379,
            db: 0,
            key_prefix: "stats".to_string(),
            connect_attempts: 30,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn redis(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            host: self.host.clone(),
            port: self.port,
            db: self.db,
            key_prefix: self.key_prefix.clone(),
        }
    }

    fn from_env(env: &mut EnvReader) -> Self {
        let defaults = Self::default();
        Self {
            host: env.string("REDIS_HOST", defaults.host),
            port: env.parse("REDIS_PORT", defaults.port),
            db: env.parse("REDIS_DB", defaults.db),
            key_prefix: env.string("REDIS_KEY_PREFIX", defaults.key_prefix),
            connect_attempts: env.parse("STORE_CONNECT_ATTEMPTS", defaults.connect_attempts),
            backoff_base_ms: env.parse("STORE_BACKOFF_BASE_MS", defaults.backoff_base_ms),
            backoff_max_ms: env.parse("STORE_BACKOFF_MAX_MS", defaults.backoff_max_ms),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TallyConfig {
    pub queue: QueueConfig,
    pub processor: ProcessorConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
}

impl TallyConfig {
    /// Load from `path` when given, otherwise from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::from_env(),
        }
    }

    /// Read every setting from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_reader(EnvReader::new())
    }

    /// Read every setting through `env`, then validate.
    pub fn from_env_reader(mut env: EnvReader) -> Result<Self, ConfigError> {
        let config = Self {
            queue: QueueConfig::from_env(&mut env),
            processor: ProcessorConfig::from_env(&mut env),
            store: StoreConfig::from_env(&mut env),
            server: ServerConfig::from_env(&mut env),
        };
        env.finish()?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file, expanding environment variable references first.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        ensure!(is_yaml_file(path), UnsupportedFormatSnafu { path });

        let raw = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        debug!(path = %path.display(), "Loaded config file");
        Self::from_yaml(&raw)
    }

    /// Parse YAML text, expanding environment variable references first.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate(raw);
        if !interpolated.is_ok() {
            return Err(ConfigError::EnvInterpolation {
                message: interpolated.errors.join("\n"),
            });
        }

        let config: Self = serde_yaml::from_str(&interpolated.text).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.queue.name.trim().is_empty() {
            errors.push("queue.name: must not be empty".to_string());
        }
        if self.queue.dlq_name().trim().is_empty() {
            errors.push("queue.dlq_name: must not be empty".to_string());
        }
        if self.queue.max_receive_count == 0 {
            errors.push("queue.max_receive_count: must be at least 1".to_string());
        }
        if self.queue.visibility_timeout_secs > MAX_VISIBILITY_TIMEOUT_SECS {
            errors.push(format!(
                "queue.visibility_timeout_secs: must be at most {MAX_VISIBILITY_TIMEOUT_SECS}"
            ));
        }
        if self.queue.wait_time_secs > MAX_WAIT_TIME_SECS {
            errors.push(format!(
                "queue.wait_time_secs: must be at most {MAX_WAIT_TIME_SECS}"
            ));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.processor.batch_size) {
            errors.push(format!(
                "processor.batch_size: must be between 1 and {MAX_BATCH_SIZE}"
            ));
        }
        if self.store.connect_attempts == 0 {
            errors.push("store.connect_attempts: must be at least 1".to_string());
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(ConfigError::InvalidValue {
                field: "config".to_string(),
                reason: errors.remove(0),
            }),
            _ => Err(ConfigError::MultipleErrors { errors }),
        }
    }

    pub fn receive_options(&self) -> ReceiveOptions {
        ReceiveOptions {
            max_messages: self.processor.batch_size,
            wait_time_secs: self.queue.wait_time_secs,
            visibility_timeout_secs: self.queue.visibility_timeout_secs,
        }
    }
}
