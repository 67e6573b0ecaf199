//! Pool configuration: defaults, builder methods, environment overrides.

use std::time::Duration;

pub const DEFAULT_INITIAL_CAPACITY: usize = 1;
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(3000);
pub const DEFAULT_CUTBACK_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_CUTBACK_MIN_RATIO: f64 = 0.9;

/// The regulator never fires more often than this.
pub const MIN_CUTBACK_PERIOD: Duration = Duration::from_secs(10);

/// Floor applied to `check_interval` when the ticker starts.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

pub const ENV_INITIAL_CAPACITY: &str = "CAPTCHA_POOL_INITIAL_CAPACITY";
pub const ENV_CHECK_INTERVAL_MS: &str = "CAPTCHA_POOL_CHECK_INTERVAL_MS";
pub const ENV_CAPACITY_DYNAMIC: &str = "CAPTCHA_POOL_CAPACITY_DYNAMIC";
pub const ENV_CUTBACK_INTERVAL_MS: &str = "CAPTCHA_POOL_CUTBACK_INTERVAL_MS";
pub const ENV_CUTBACK_MIN_RATIO: &str = "CAPTCHA_POOL_CUTBACK_MIN_RATIO";
pub const ENV_FORKS: &str = "CAPTCHA_POOL_FORKS";
pub const ENV_WORKER_TIMEOUT_MS: &str = "CAPTCHA_POOL_WORKER_TIMEOUT_MS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: expected {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Starting target for in-flight plus ready artifacts.
    pub initial_capacity: usize,
    /// Ticker period.
    pub check_interval: Duration,
    /// Whether `pop` demand raises capacity and the regulator lowers it.
    pub capacity_dynamic: bool,
    /// Regulator period (floored at [`MIN_CUTBACK_PERIOD`]). Zero disables the regulator.
    pub capacity_cutback_interval: Duration,
    /// Ready/capacity ratio above which the regulator cuts capacity back.
    pub capacity_cutback_min_ratio: f64,
    /// Run each generation in an isolated worker process.
    pub forks: bool,
    /// Kill isolated workers that take longer than this. `None` waits forever.
    pub worker_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            check_interval: DEFAULT_CHECK_INTERVAL,
            capacity_dynamic: true,
            capacity_cutback_interval: DEFAULT_CUTBACK_INTERVAL,
            capacity_cutback_min_ratio: DEFAULT_CUTBACK_MIN_RATIO,
            forks: true,
            worker_timeout: None,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_capacity_dynamic(mut self, dynamic: bool) -> Self {
        self.capacity_dynamic = dynamic;
        self
    }

    pub fn with_capacity_cutback_interval(mut self, interval: Duration) -> Self {
        self.capacity_cutback_interval = interval;
        self
    }

    pub fn with_capacity_cutback_min_ratio(mut self, ratio: f64) -> Self {
        self.capacity_cutback_min_ratio = ratio;
        self
    }

    pub fn with_forks(mut self, forks: bool) -> Self {
        self.forks = forks;
        self
    }

    pub fn with_worker_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.worker_timeout = timeout;
        self
    }

    /// Regulator period, or `None` when the regulator should not run.
    pub fn cutback_period(&self) -> Option<Duration> {
        if self.capacity_dynamic && !self.capacity_cutback_interval.is_zero() {
            Some(self.capacity_cutback_interval.max(MIN_CUTBACK_PERIOD))
        } else {
            None
        }
    }

    /// Defaults overridden by `CAPTCHA_POOL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_INITIAL_CAPACITY) {
            config.initial_capacity = parse_usize(ENV_INITIAL_CAPACITY, &value)?;
        }
        if let Some(value) = lookup(ENV_CHECK_INTERVAL_MS) {
            let interval = parse_millis(ENV_CHECK_INTERVAL_MS, &value)?;
            if interval.is_zero() {
                return Err(invalid(ENV_CHECK_INTERVAL_MS, &value, "a positive number of milliseconds"));
            }
            config.check_interval = interval;
        }
        if let Some(value) = lookup(ENV_CAPACITY_DYNAMIC) {
            config.capacity_dynamic = parse_bool(ENV_CAPACITY_DYNAMIC, &value)?;
        }
        if let Some(value) = lookup(ENV_CUTBACK_INTERVAL_MS) {
            config.capacity_cutback_interval = parse_millis(ENV_CUTBACK_INTERVAL_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_CUTBACK_MIN_RATIO) {
            config.capacity_cutback_min_ratio = value
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|ratio| ratio.is_finite() && *ratio >= 0.0)
                .ok_or_else(|| invalid(ENV_CUTBACK_MIN_RATIO, &value, "a non-negative ratio"))?;
        }
        if let Some(value) = lookup(ENV_FORKS) {
            config.forks = parse_bool(ENV_FORKS, &value)?;
        }
        if let Some(value) = lookup(ENV_WORKER_TIMEOUT_MS) {
            let timeout = parse_millis(ENV_WORKER_TIMEOUT_MS, &value)?;
            config.worker_timeout = (!timeout.is_zero()).then_some(timeout);
        }

        Ok(config)
    }
}

fn invalid(var: &'static str, value: &str, expected: &'static str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        expected,
    }
}

fn parse_usize(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(var, value, "a non-negative integer"))
}

fn parse_millis(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse()
        .map(Duration::from_millis)
        .map_err(|_| invalid(var, value, "milliseconds"))
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, value, "a boolean")),
    }
}
