//! Driver-wide defaults.
//!
//! Values come from [`DriverConfig::default`] and can be overridden from the
//! environment with [`DriverConfig::from_env`] or programmatically with the
//! `with_*` setters.
//!
//! | Environment variable            | Default   |
//! |---------------------------------|-----------|
//! | `XCC_REQUEST_RETRIES_MAX`       | 4         |
//! | `XCC_REQUEST_RETRY_DELAY_MS`    | 100       |
//! | `XCC_RESULT_BUFFER_SIZE`        | 65536     |
//! | `XCC_POOL_IDLE_TIMEOUT_MS`      | 60000     |
//! | `XCC_REAPER_INTERVAL_MS`        | 1000      |
//! | `XCC_CONNECT_TIMEOUT_MS`        | 30000     |
//! | `XCC_COMPAT_MIN_VERSION`        | 7.0.0     |
//! | `XCC_COMPAT_NIGHTLY_PREFIXES`   | (empty)   |

use crate::connection::transaction::{CompatibilityPolicy, ServerVersion};
use std::env;
use std::str::FromStr;
use std::time::Duration;

const ENV_RETRIES_MAX: &str = "XCC_REQUEST_RETRIES_MAX";
const ENV_RETRY_DELAY_MS: &str = "XCC_REQUEST_RETRY_DELAY_MS";
const ENV_RESULT_BUFFER_SIZE: &str = "XCC_RESULT_BUFFER_SIZE";
const ENV_POOL_IDLE_TIMEOUT_MS: &str = "XCC_POOL_IDLE_TIMEOUT_MS";
const ENV_REAPER_INTERVAL_MS: &str = "XCC_REAPER_INTERVAL_MS";
const ENV_CONNECT_TIMEOUT_MS: &str = "XCC_CONNECT_TIMEOUT_MS";
const ENV_COMPAT_MIN_VERSION: &str = "XCC_COMPAT_MIN_VERSION";
const ENV_COMPAT_NIGHTLY_PREFIXES: &str = "XCC_COMPAT_NIGHTLY_PREFIXES";

/// Shortest interval between reaper sweeps.
pub const MIN_REAPER_INTERVAL: Duration = Duration::from_millis(1);

/// Defaults applied when neither the request nor the session sets a value.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Default retry budget for generic requests
    pub max_auto_retry: u32,

    /// Delay between generic request retries
    pub auto_retry_delay: Duration,

    /// Default result buffer size in bytes
    pub result_buffer_size: usize,

    /// How long an idle pooled connection is kept
    pub pool_idle_timeout: Duration,

    /// Interval between reaper sweeps
    pub reaper_interval: Duration,

    /// Timeout for establishing a transport connection
    pub connect_timeout: Duration,

    /// Decides when the server needs explicit transaction-mode statements
    pub compatibility: CompatibilityPolicy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_auto_retry: 4,
            auto_retry_delay: Duration::from_millis(100),
            result_buffer_size: 64 * 1024,
            pool_idle_timeout: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            compatibility: CompatibilityPolicy::default(),
        }
    }
}

impl DriverConfig {
    /// Build from defaults, overridden by any `XCC_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse::<u32>(ENV_RETRIES_MAX) {
            config.max_auto_retry = v;
        }
        if let Some(v) = env_parse::<u64>(ENV_RETRY_DELAY_MS) {
            config.auto_retry_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<usize>(ENV_RESULT_BUFFER_SIZE) {
            config.result_buffer_size = v;
        }
        if let Some(v) = env_parse::<u64>(ENV_POOL_IDLE_TIMEOUT_MS) {
            config.pool_idle_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>(ENV_REAPER_INTERVAL_MS) {
            config = config.with_reaper_interval(Duration::from_millis(v));
        }
        if let Some(v) = env_parse::<u64>(ENV_CONNECT_TIMEOUT_MS) {
            config.connect_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<ServerVersion>(ENV_COMPAT_MIN_VERSION) {
            config.compatibility.min_mode_cookie_version = v;
        }
        if let Ok(prefixes) = env::var(ENV_COMPAT_NIGHTLY_PREFIXES) {
            config.compatibility.nightly_prefixes = prefixes
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }

        config
    }

    /// Set the generic request retry budget.
    pub fn with_max_auto_retry(mut self, retries: u32) -> Self {
        self.max_auto_retry = retries;
        self
    }

    /// Set the generic request retry delay.
    pub fn with_auto_retry_delay(mut self, delay: Duration) -> Self {
        self.auto_retry_delay = delay;
        self
    }

    /// Set the result buffer size.
    pub fn with_result_buffer_size(mut self, size: usize) -> Self {
        self.result_buffer_size = size;
        self
    }

    /// Set the idle timeout for pooled connections.
    pub fn with_pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = timeout;
        self
    }

    /// Set the reaper sweep interval, raised to [`MIN_REAPER_INTERVAL`].
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval.max(MIN_REAPER_INTERVAL);
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the compatibility policy.
    pub fn with_compatibility(mut self, policy: CompatibilityPolicy) -> Self {
        self.compatibility = policy;
        self
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
