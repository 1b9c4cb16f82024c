use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::stream::error::{Error, Result};

/// Where to start a partition that has no committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// The oldest retained record (low watermark)
    Earliest,
    /// Only records produced after assignment (high watermark)
    #[default]
    Latest,
}

impl FromStr for OffsetReset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            other => Err(Error::Validation(format!(
                "offset reset must be 'earliest' or 'latest', got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetReset::Earliest => f.write_str("earliest"),
            OffsetReset::Latest => f.write_str("latest"),
        }
    }
}

/// Bounded exponential backoff
///
/// `max_attempts` counts every try including the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms,
            max_backoff_ms,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    ///
    /// Doubles from `initial_backoff_ms` and is capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let millis = 1u64
            .checked_shl(exponent)
            .and_then(|factor| self.initial_backoff_ms.checked_mul(factor))
            .unwrap_or(u64::MAX)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

/// What the loop does when the handler fails on a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Report the failure and treat the record as processed
    #[default]
    SkipAndLog,
    /// Retry the same record with backoff, then dead-letter it
    HaltAndRetry(RetryPolicy),
}

/// Configuration for a consumer instance
///
/// # Example
///
/// ```
/// use consumer_pipeline::stream::{ConsumerConfig, FailurePolicy, OffsetReset, RetryPolicy};
///
/// let config = ConsumerConfig::new("notifications", "notification-group")
///     .with_max_batch_size(100)
///     .with_offset_reset(OffsetReset::Earliest)
///     .with_failure_policy(FailurePolicy::HaltAndRetry(RetryPolicy::new(3, 50, 1_000)));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Broker bootstrap addresses, used by networked broker clients
    pub brokers: Vec<String>,
    pub group_id: String,
    pub topic: String,
    /// Client identifier used in logs
    pub client_id: String,
    pub max_batch_size: usize,
    pub poll_timeout_ms: u64,
    pub offset_reset: OffsetReset,
    pub failure_policy: FailurePolicy,
    pub commit_retry: RetryPolicy,
    /// Handler invocations running longer than this count as failures
    pub handler_timeout_ms: Option<u64>,
    /// Confluent-compatible registry to fetch writer schemas from
    pub schema_registry_url: Option<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            group_id: "consumer-pipeline".to_string(),
            topic: String::new(),
            client_id: "consumer-pipeline".to_string(),
            max_batch_size: 500,
            poll_timeout_ms: 100,
            offset_reset: OffsetReset::default(),
            failure_policy: FailurePolicy::default(),
            commit_retry: RetryPolicy::default(),
            handler_timeout_ms: None,
            schema_registry_url: None,
        }
    }
}

impl ConsumerConfig {
    /// Create a configuration for `topic` consumed by `group_id`
    pub fn new(topic: &str, group_id: &str) -> Self {
        Self {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_brokers(mut self, brokers: Vec<String>) -> Self {
        self.brokers = brokers;
        self
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.client_id = client_id.to_string();
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_poll_timeout_ms(mut self, poll_timeout_ms: u64) -> Self {
        self.poll_timeout_ms = poll_timeout_ms;
        self
    }

    pub fn with_offset_reset(mut self, offset_reset: OffsetReset) -> Self {
        self.offset_reset = offset_reset;
        self
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn with_commit_retry(mut self, commit_retry: RetryPolicy) -> Self {
        self.commit_retry = commit_retry;
        self
    }

    pub fn with_handler_timeout_ms(mut self, handler_timeout_ms: u64) -> Self {
        self.handler_timeout_ms = Some(handler_timeout_ms);
        self
    }

    pub fn with_schema_registry_url(mut self, url: &str) -> Self {
        self.schema_registry_url = Some(url.to_string());
        self
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }

    /// Check the configuration before a consumer is started
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(Error::Validation("topic must not be empty".to_string()));
        }
        if self.group_id.trim().is_empty() {
            return Err(Error::Validation("group id must not be empty".to_string()));
        }
        if self.max_batch_size == 0 {
            return Err(Error::Validation(
                "max batch size must be greater than zero".to_string(),
            ));
        }
        if self.commit_retry.max_attempts == 0 {
            return Err(Error::Validation(
                "commit retry needs at least one attempt".to_string(),
            ));
        }
        if let FailurePolicy::HaltAndRetry(retry) = &self.failure_policy {
            if retry.max_attempts == 0 {
                return Err(Error::Validation(
                    "halt-and-retry needs at least one attempt".to_string(),
                ));
            }
        }
        if self.handler_timeout_ms == Some(0) {
            return Err(Error::Validation(
                "handler timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Build a configuration from `STREAM_*` environment variables
    ///
    /// Unset variables keep their defaults. Recognised variables:
    /// `STREAM_BROKERS` (comma separated), `STREAM_GROUP_ID`, `STREAM_TOPIC`,
    /// `STREAM_CLIENT_ID`, `STREAM_MAX_BATCH_SIZE`, `STREAM_POLL_TIMEOUT_MS`,
    /// `STREAM_OFFSET_RESET`, `STREAM_FAILURE_POLICY` (`skip_and_log` or
    /// `halt_and_retry`), `STREAM_HANDLER_MAX_ATTEMPTS`,
    /// `STREAM_HANDLER_BACKOFF_MS`, `STREAM_COMMIT_MAX_ATTEMPTS`,
    /// `STREAM_COMMIT_BACKOFF_MS`, `STREAM_HANDLER_TIMEOUT_MS`,
    /// `STREAM_SCHEMA_REGISTRY_URL`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(brokers) = lookup("STREAM_BROKERS") {
            config.brokers = brokers
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(group_id) = lookup("STREAM_GROUP_ID") {
            config.group_id = group_id;
        }
        if let Some(topic) = lookup("STREAM_TOPIC") {
            config.topic = topic;
        }
        if let Some(client_id) = lookup("STREAM_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Some(size) = lookup("STREAM_MAX_BATCH_SIZE") {
            config.max_batch_size = parse_number("STREAM_MAX_BATCH_SIZE", &size)?;
        }
        if let Some(ms) = lookup("STREAM_POLL_TIMEOUT_MS") {
            config.poll_timeout_ms = parse_number("STREAM_POLL_TIMEOUT_MS", &ms)?;
        }
        if let Some(reset) = lookup("STREAM_OFFSET_RESET") {
            config.offset_reset = reset.parse()?;
        }
        if let Some(attempts) = lookup("STREAM_COMMIT_MAX_ATTEMPTS") {
            config.commit_retry.max_attempts = parse_number("STREAM_COMMIT_MAX_ATTEMPTS", &attempts)?;
        }
        if let Some(ms) = lookup("STREAM_COMMIT_BACKOFF_MS") {
            config.commit_retry.initial_backoff_ms = parse_number("STREAM_COMMIT_BACKOFF_MS", &ms)?;
        }
        if let Some(ms) = lookup("STREAM_HANDLER_TIMEOUT_MS") {
            config.handler_timeout_ms = Some(parse_number("STREAM_HANDLER_TIMEOUT_MS", &ms)?);
        }
        if let Some(url) = lookup("STREAM_SCHEMA_REGISTRY_URL") {
            config.schema_registry_url = Some(url);
        }

        if let Some(policy) = lookup("STREAM_FAILURE_POLICY") {
            config.failure_policy = match policy.trim().to_ascii_lowercase().as_str() {
                "skip_and_log" | "skip" => FailurePolicy::SkipAndLog,
                "halt_and_retry" | "retry" => {
                    let mut retry = RetryPolicy::new(3, 100, 5_000);
                    if let Some(attempts) = lookup("STREAM_HANDLER_MAX_ATTEMPTS") {
                        retry.max_attempts = parse_number("STREAM_HANDLER_MAX_ATTEMPTS", &attempts)?;
                    }
                    if let Some(ms) = lookup("STREAM_HANDLER_BACKOFF_MS") {
                        retry.initial_backoff_ms = parse_number("STREAM_HANDLER_BACKOFF_MS", &ms)?;
                    }
                    FailurePolicy::HaltAndRetry(retry)
                }
                other => {
                    return Err(Error::Validation(format!(
                        "unknown failure policy '{}'",
                        other
                    )))
                }
            };
        }

        Ok(config)
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Validation(format!("{} must be a number, got '{}'", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ConsumerConfig::new("notifications", "group");
        assert_eq!(config.max_batch_size, 500);
        assert_eq!(config.poll_timeout(), Duration::from_millis(100));
        assert_eq!(config.offset_reset, OffsetReset::Latest);
        assert_eq!(config.failure_policy, FailurePolicy::SkipAndLog);
        assert_eq!(config.commit_retry, RetryPolicy::new(5, 100, 5_000));
        assert_eq!(config.handler_timeout(), None);
    }

    #[test]
    fn test_builder() {
        let config = ConsumerConfig::new("notifications", "group")
            .with_max_batch_size(10)
            .with_poll_timeout_ms(250)
            .with_handler_timeout_ms(1_000)
            .with_client_id("worker-1");

        assert_eq!(config.max_batch_size, 10);
        assert_eq!(config.poll_timeout_ms, 250);
        assert_eq!(config.handler_timeout(), Some(Duration::from_secs(1)));
        assert_eq!(config.client_id, "worker-1");
    }

    #[test]
    fn test_validate() {
        assert!(ConsumerConfig::new("", "group").validate().is_err());
        assert!(ConsumerConfig::new("notifications", " ").validate().is_err());
        assert!(ConsumerConfig::new("notifications", "group")
            .with_max_batch_size(0)
            .validate()
            .is_err());
        assert!(ConsumerConfig::new("notifications", "group")
            .with_failure_policy(FailurePolicy::HaltAndRetry(RetryPolicy::new(0, 10, 10)))
            .validate()
            .is_err());
        assert!(ConsumerConfig::new("notifications", "group").validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy::new(10, 100, 1_000);
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(4), Duration::from_millis(800));
        assert_eq!(retry.backoff(5), Duration::from_millis(1_000));
        assert_eq!(retry.backoff(80), Duration::from_millis(1_000));
    }

    #[test]
    fn test_offset_reset_from_str() {
        assert_eq!("Earliest".parse::<OffsetReset>().unwrap(), OffsetReset::Earliest);
        assert_eq!("latest".parse::<OffsetReset>().unwrap(), OffsetReset::Latest);
        assert!("middle".parse::<OffsetReset>().is_err());
    }

    #[test]
    fn test_from_lookup() {
        let config = ConsumerConfig::from_lookup(lookup(&[
            ("STREAM_BROKERS", "a:9092, b:9092"),
            ("STREAM_TOPIC", "notifications"),
            ("STREAM_GROUP_ID", "notification-group"),
            ("STREAM_OFFSET_RESET", "earliest"),
            ("STREAM_FAILURE_POLICY", "halt_and_retry"),
            ("STREAM_HANDLER_MAX_ATTEMPTS", "4"),
            ("STREAM_HANDLER_TIMEOUT_MS", "2000"),
        ]))
        .unwrap();

        assert_eq!(config.brokers, vec!["a:9092", "b:9092"]);
        assert_eq!(config.topic, "notifications");
        assert_eq!(config.offset_reset, OffsetReset::Earliest);
        assert_eq!(
            config.failure_policy,
            FailurePolicy::HaltAndRetry(RetryPolicy::new(4, 100, 5_000))
        );
        assert_eq!(config.handler_timeout_ms, Some(2_000));
    }

    #[test]
    fn test_from_lookup_rejects_bad_numbers() {
        let err = ConsumerConfig::from_lookup(lookup(&[("STREAM_MAX_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, Error::Validation(ref msg) if msg.contains("STREAM_MAX_BATCH_SIZE")));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{
            "topic": "notifications",
            "group_id": "group",
            "failure_policy": {"policy": "halt_and_retry", "max_attempts": 3, "initial_backoff_ms": 10, "max_backoff_ms": 100}
        }"#;
        let config: ConsumerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_batch_size, 500);
        assert_eq!(
            config.failure_policy,
            FailurePolicy::HaltAndRetry(RetryPolicy::new(3, 10, 100))
        );
    }
}
