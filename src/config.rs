//! Configuration management for Sluice.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then environment variables. The environment variable names match the ones
//! the producer and drainer have always read (`REDIS_HOST`, `QUEUE_KEY`,
//! `RATE_LIMIT`, `PUBLISH_RATE`, ...).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SluiceError};

/// Main configuration for the Sluice service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SluiceConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Sliding-window limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Drain loop configuration
    #[serde(default)]
    pub drain: DrainConfig,

    /// Producer loop configuration
    #[serde(default)]
    pub producer: ProducerConfig,

    /// Publish sink configuration
    #[serde(default)]
    pub sink: SinkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis host
    #[serde(default = "default_host")]
    pub host: String,

    /// Redis port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Redis password, if the server requires AUTH
    #[serde(default)]
    pub password: Option<String>,

    /// Key of the work queue list
    #[serde(default = "default_queue_key")]
    pub queue_key: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: None,
            queue_key: default_queue_key(),
        }
    }
}

impl StoreConfig {
    /// Key of the rate-limit log derived from the queue key.
    pub fn log_key(&self) -> String {
        format!("{}:log", self.queue_key)
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_queue_key() -> String {
    "myJobQueue".to_string()
}

/// Sliding-window limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum admissions per window
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u64,

    /// Window size in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Optimistic transaction attempts before giving up (0 = unbounded)
    #[serde(default = "default_tx_max_attempts")]
    pub tx_max_attempts: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate_limit: default_rate_limit(),
            window_ms: default_window_ms(),
            tx_max_attempts: default_tx_max_attempts(),
        }
    }
}

impl LimiterConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

fn default_rate_limit() -> u64 {
    50
}

fn default_window_ms() -> u64 {
    1000
}

fn default_tx_max_attempts() -> u32 {
    100
}

/// Drain loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainConfig {
    /// Number of drain workers in this process
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Topic every forwarded payload is published under
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Pause after a rejected admission, in milliseconds
    #[serde(default = "default_reject_backoff_ms")]
    pub reject_backoff_ms: u64,

    /// Pause after a failed iteration, in milliseconds
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,

    /// Upper bound of a single blocking pop, in milliseconds
    #[serde(default = "default_dequeue_poll_timeout_ms")]
    pub dequeue_poll_timeout_ms: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            topic: default_topic(),
            reject_backoff_ms: default_reject_backoff_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            dequeue_poll_timeout_ms: default_dequeue_poll_timeout_ms(),
        }
    }
}

impl DrainConfig {
    pub fn reject_backoff(&self) -> Duration {
        Duration::from_millis(self.reject_backoff_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn dequeue_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_poll_timeout_ms)
    }
}

fn default_workers() -> usize {
    1
}

fn default_topic() -> String {
    "trade".to_string()
}

fn default_reject_backoff_ms() -> u64 {
    10
}

fn default_error_backoff_ms() -> u64 {
    250
}

fn default_dequeue_poll_timeout_ms() -> u64 {
    1000
}

/// Producer loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Payloads appended per tick
    #[serde(default = "default_burst_size")]
    pub burst_size: usize,

    /// Seconds between ticks
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Centre of the synthetic values
    #[serde(default = "default_base_value")]
    pub base_value: f64,

    /// Maximum distance of a value from `base_value`
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            burst_size: default_burst_size(),
            interval_secs: default_interval_secs(),
            base_value: default_base_value(),
            jitter: default_jitter(),
        }
    }
}

impl ProducerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_burst_size() -> usize {
    200
}

/// Longest accepted publish interval, one day.
const MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;

fn default_interval_secs() -> u64 {
    5
}

fn default_base_value() -> f64 {
    200.0
}

fn default_jitter() -> f64 {
    5.0
}

/// Which downstream sink the drainer forwards to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Redis pub/sub channel
    #[default]
    Redis,
    /// Tracing events only
    Log,
}

/// Publish sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,

    /// Credential presented to the sink
    #[serde(default)]
    pub key: Option<String>,

    /// Channel the sink publishes on
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Sink host; falls back to the store host
    #[serde(default)]
    pub host: Option<String>,

    /// Sink port; falls back to the store port
    #[serde(default)]
    pub port: Option<u16>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::default(),
            key: None,
            channel: default_channel(),
            host: None,
            port: None,
        }
    }
}

fn default_channel() -> String {
    "channel-name".to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

/// Flat view of the environment variables the service understands.
///
/// Every field is optional; a present value overrides the matching field of
/// [`SluiceConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvOverrides {
    pub redis_host: Option<String>,
    pub redis_port: Option<u16>,
    pub redis_password: Option<String>,
    pub queue_key: Option<String>,
    pub rate_limit: Option<u64>,
    pub window_ms: Option<u64>,
    pub tx_max_attempts: Option<u32>,
    pub drain_workers: Option<usize>,
    pub topic: Option<String>,
    pub reject_backoff_ms: Option<u64>,
    pub error_backoff_ms: Option<u64>,
    pub dequeue_poll_timeout_ms: Option<u64>,
    pub publish_rate: Option<usize>,
    pub publish_interval_secs: Option<u64>,
    pub sink_kind: Option<SinkKind>,
    pub sink_key: Option<String>,
    pub sink_host: Option<String>,
    pub sink_port: Option<u16>,
    pub channel_name: Option<String>,
    pub log_format: Option<LogFormat>,
}

impl EnvOverrides {
    /// Collect overrides from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::collect(config::Environment::default())
    }

    /// Collect overrides from an explicit variable map instead of the process
    /// environment.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        Self::collect(config::Environment::default().source(Some(vars)))
    }

    fn collect(source: config::Environment) -> Result<Self> {
        config::Config::builder()
            .add_source(source.try_parsing(true).ignore_empty(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SluiceError::Config(e.to_string()))
    }

    /// Apply every present override onto `config`.
    pub fn apply(self, config: &mut SluiceConfig) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(v) = value {
                *slot = v;
            }
        }

        set(&mut config.store.host, self.redis_host);
        set(&mut config.store.port, self.redis_port);
        if self.redis_password.is_some() {
            config.store.password = self.redis_password;
        }
        set(&mut config.store.queue_key, self.queue_key);

        set(&mut config.limiter.rate_limit, self.rate_limit);
        set(&mut config.limiter.window_ms, self.window_ms);
        set(&mut config.limiter.tx_max_attempts, self.tx_max_attempts);

        set(&mut config.drain.workers, self.drain_workers);
        set(&mut config.drain.topic, self.topic);
        set(&mut config.drain.reject_backoff_ms, self.reject_backoff_ms);
        set(&mut config.drain.error_backoff_ms, self.error_backoff_ms);
        set(
            &mut config.drain.dequeue_poll_timeout_ms,
            self.dequeue_poll_timeout_ms,
        );

        set(&mut config.producer.burst_size, self.publish_rate);
        set(&mut config.producer.interval_secs, self.publish_interval_secs);

        set(&mut config.sink.kind, self.sink_kind);
        if self.sink_key.is_some() {
            config.sink.key = self.sink_key;
        }
        if self.sink_host.is_some() {
            config.sink.host = self.sink_host;
        }
        if self.sink_port.is_some() {
            config.sink.port = self.sink_port;
        }
        set(&mut config.sink.channel, self.channel_name);

        set(&mut config.logging.format, self.log_format);
    }
}

impl SluiceConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SluiceConfig =
            serde_yaml::from_str(&contents).map_err(|e| SluiceError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Load the full configuration: defaults, then the optional file, then
    /// the process environment. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        EnvOverrides::from_env()?.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(SluiceError::Config(msg.to_string()));

        if self.store.queue_key.is_empty() {
            return fail("queue key must not be empty");
        }
        if self.limiter.rate_limit == 0 {
            return fail("rate limit must be at least 1");
        }
        if self.limiter.window_ms == 0 {
            return fail("window must be longer than 0ms");
        }
        if self.drain.workers == 0 {
            return fail("at least one drain worker is required");
        }
        if self.drain.topic.is_empty() {
            return fail("topic must not be empty");
        }
        if self.drain.dequeue_poll_timeout_ms == 0 {
            return fail("dequeue poll timeout must be longer than 0ms");
        }
        if self.producer.interval_secs == 0 {
            return fail("publish interval must be at least 1s");
        }
        if self.producer.interval_secs > MAX_INTERVAL_SECS {
            return fail("publish interval must be at most 24h");
        }
        if !self.producer.base_value.is_finite() {
            return fail("base value must be a finite number");
        }
        if !self.producer.jitter.is_finite() || self.producer.jitter < 0.0 {
            return fail("jitter must be a finite, non-negative number");
        }
        if self.sink.channel.is_empty() {
            return fail("sink channel must not be empty");
        }
        Ok(())
    }
}
