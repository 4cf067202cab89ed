//! Runtime configuration, read from `PAGEMONITOR_*` environment variables.

use std::time::Duration;

use thiserror::Error;

pub const ENV_PREFIX: &str = "PAGEMONITOR_";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{var}: cannot parse '{value}' as {expected}")]
    Parse {
        var: String,
        value: String,
        expected: &'static str,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Batch processor tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Bounded queue size; submits beyond it wait `submit_timeout` then fail.
    pub queue_capacity: usize,
    /// Queue depth that triggers an immediate flush. One flush drains at most
    /// twice this many items.
    pub flush_size: usize,
    pub flush_interval: Duration,
    pub max_retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub max_retry_delay: Duration,
    pub submit_timeout: Duration,
    /// Upper bound on the residual drain performed by `stop()`.
    pub drain_timeout: Duration,
    pub slow_flush_threshold: Duration,
    /// Pause after a flush task fails or panics.
    pub error_cooldown: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            flush_size: 50,
            flush_interval: Duration::from_secs(5),
            max_retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            submit_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(30),
            slow_flush_threshold: Duration::from_secs(1),
            error_cooldown: Duration::from_secs(1),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_size == 0 {
            return Err(ConfigError::Invalid("flush size must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue capacity must be at least 1".to_string()));
        }
        if self.queue_capacity < self.flush_size {
            return Err(ConfigError::Invalid(format!(
                "queue capacity {} is smaller than flush size {}",
                self.queue_capacity, self.flush_size
            )));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid("flush interval must be non-zero".to_string()));
        }
        if self.retry_base_delay > self.max_retry_delay {
            return Err(ConfigError::Invalid(format!(
                "retry base delay {:?} exceeds max retry delay {:?}",
                self.retry_base_delay, self.max_retry_delay
            )));
        }
        Ok(())
    }

    /// Backoff before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max_retry_delay`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.retry_base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_retry_delay)
            .min(self.max_retry_delay)
    }
}

/// Report engine tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportConfig {
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub scan_timeout: Duration,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 50,
            cache_ttl: Duration::from_secs(5),
            scan_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub batch: BatchConfig,
    pub report: ReportConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Names are looked up with the
    /// `PAGEMONITOR_` prefix; unset or empty variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(format!("{}{}", ENV_PREFIX, name).as_str()).filter(|v| !v.trim().is_empty())
        };
        let mut config = Config::default();
        let batch = &mut config.batch;

        if let Some(v) = get("BATCH_SIZE") {
            batch.flush_size = parse("BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("BATCH_INTERVAL_SECS") {
            batch.flush_interval = Duration::from_secs(parse("BATCH_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = get("BATCH_MAX_QUEUE_SIZE") {
            batch.queue_capacity = parse("BATCH_MAX_QUEUE_SIZE", &v)?;
        }
        if let Some(v) = get("BATCH_RETRY_MAX_ATTEMPTS") {
            batch.max_retry_attempts = parse("BATCH_RETRY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("BATCH_RETRY_BASE_DELAY_MS") {
            batch.retry_base_delay = Duration::from_millis(parse("BATCH_RETRY_BASE_DELAY_MS", &v)?);
        }
        if let Some(v) = get("BATCH_SUBMIT_TIMEOUT_MS") {
            batch.submit_timeout = Duration::from_millis(parse("BATCH_SUBMIT_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("BATCH_DRAIN_TIMEOUT_SECS") {
            batch.drain_timeout = Duration::from_secs(parse("BATCH_DRAIN_TIMEOUT_SECS", &v)?);
        }

        let report = &mut config.report;
        if let Some(v) = get("REPORT_CACHE_TTL_SECS") {
            report.cache_ttl = Duration::from_secs(parse("REPORT_CACHE_TTL_SECS", &v)?);
        }
        if let Some(v) = get("REPORT_CACHE_CAPACITY") {
            report.cache_capacity = parse("REPORT_CACHE_CAPACITY", &v)?;
        }
        if let Some(v) = get("REPORT_SCAN_TIMEOUT_SECS") {
            report.scan_timeout = Duration::from_secs(parse("REPORT_SCAN_TIMEOUT_SECS", &v)?);
        }

        config.validate()?;
        tracing::info!(
            "Loaded config: flush_size={}, flush_interval={:?}, queue_capacity={}, max_retries={}, cache_ttl={:?}",
            config.batch.flush_size,
            config.batch.flush_interval,
            config.batch.queue_capacity,
            config.batch.max_retry_attempts,
            config.report.cache_ttl
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.batch.validate()?;
        if self.report.scan_timeout.is_zero() {
            return Err(ConfigError::Invalid("scan timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::Parse {
        var: format!("{}{}", ENV_PREFIX, name),
        value: value.to_string(),
        expected: std::any::type_name::<T>(),
    })
}
