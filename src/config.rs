//! Configuration for agent-relay.
//!
//! Settings are loaded with priority: explicit overrides > env vars > defaults.
//! A `.env` file in the working directory is loaded first if present.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::transport::retry::RetryPolicy;

/// Main configuration for a relay node.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub agent: AgentConfig,
    pub transport: TransportConfig,
    pub retention: RetentionConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            agent: AgentConfig::resolve()?,
            transport: TransportConfig::resolve()?,
            retention: RetentionConfig::resolve()?,
        })
    }
}

/// Identity and processing-loop settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent identifier placed in the `sender` field of outbound messages.
    pub name: String,
    /// Capabilities advertised on registration.
    pub capabilities: Vec<String>,
    /// How long the intake and task loops sleep when there is nothing to do.
    pub idle_poll: Duration,
    /// How long a task may stay blocked on dependencies before it is failed.
    pub dependency_timeout: Duration,
    /// Upper bound on a single executor call (`None` = unbounded).
    pub execution_timeout: Option<Duration>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "agent".to_string(),
            capabilities: Vec::new(),
            idle_poll: Duration::from_millis(50),
            dependency_timeout: Duration::from_secs(300),
            execution_timeout: None,
        }
    }
}

impl AgentConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            name: optional_env("AGENT_NAME")?.unwrap_or(defaults.name),
            capabilities: optional_env("AGENT_CAPABILITIES")?
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(defaults.capabilities),
            idle_poll: parse_env::<u64>("AGENT_IDLE_POLL_MS", "a positive integer")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_poll),
            dependency_timeout: parse_env::<u64>(
                "AGENT_DEPENDENCY_TIMEOUT_SECS",
                "a positive integer",
            )?
            .map(Duration::from_secs)
            .unwrap_or(defaults.dependency_timeout),
            execution_timeout: parse_env::<u64>(
                "AGENT_EXECUTION_TIMEOUT_SECS",
                "a positive integer",
            )?
            .map(Duration::from_secs),
        })
    }
}

/// Network settings for the HTTP transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    /// Listener port (0 = let the OS pick).
    pub port: u16,
    /// Retries after the first attempt.
    pub retry_count: u32,
    /// Per-attempt request timeout.
    pub timeout: Duration,
    /// Base delay for exponential backoff.
    pub backoff_base: Duration,
    /// Ceiling for a single backoff delay.
    pub backoff_max: Duration,
    /// URL peers should use to reach this agent. Required when `host` is a
    /// wildcard address such as `0.0.0.0`.
    pub advertised_url: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            retry_count: 3,
            timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            advertised_url: None,
        }
    }
}

impl TransportConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: optional_env("AGENT_HOST")?.unwrap_or(defaults.host),
            port: parse_env::<u16>("AGENT_PORT", "a valid port (0-65535)")?
                .unwrap_or(defaults.port),
            retry_count: parse_env::<u32>("AGENT_RETRY_COUNT", "a non-negative integer")?
                .unwrap_or(defaults.retry_count),
            timeout: parse_env::<u64>("AGENT_TIMEOUT_SECS", "a positive integer")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            backoff_base: parse_seconds("AGENT_BACKOFF_BASE_SECS")?
                .unwrap_or(defaults.backoff_base),
            backoff_max: parse_seconds("AGENT_BACKOFF_MAX_SECS")?
                .unwrap_or(defaults.backoff_max),
            advertised_url: optional_env("AGENT_ADVERTISED_URL")?,
        })
    }

    /// Retry policy derived from these settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count, self.backoff_base, self.backoff_max)
    }
}

/// How long processed-message records and finished tasks are kept.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub window: Duration,
    /// Interval of the maintenance sweep (eviction and stalled-task checks).
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl RetentionConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            window: parse_env::<u64>("AGENT_RETENTION_WINDOW_SECS", "a positive integer")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.window),
            sweep_interval: parse_env::<u64>("AGENT_SWEEP_INTERVAL_SECS", "a positive integer")?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
        })
    }
}

/// Read an env var, treating empty values as unset.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("failed to read: {e}"),
        }),
    }
}

fn parse_env<T>(key: &str, expected: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| s.trim().parse::<T>())
        .transpose()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be {expected}: {e}"),
        })
}

/// Parse fractional seconds (e.g. `0.25`).
fn parse_seconds(key: &str) -> Result<Option<Duration>, ConfigError> {
    let Some(secs) = parse_env::<f64>(key, "a number of seconds")? else {
        return Ok(None);
    };
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be a non-negative number of seconds: {e}"),
        })
}
