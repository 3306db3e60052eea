//! Configuration for the offline client and its sync policy.
//!
//! Values come from `ERPSYNC_*` environment variables with sensible
//! defaults; embedding apps can also build the structs directly.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Floor for the worker's timers; a zero period would spin or panic.
pub(crate) const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

/// Retry, batching and scheduling policy of the sync engine and worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Mutations read from the queue per batch.
    pub batch_size: usize,
    /// Attempts after which a transient failure becomes permanent.
    pub max_attempts: u32,
    /// First backoff step after a failed cycle.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Periodic sync trigger while online.
    pub sync_interval: Duration,
    /// Periodic connectivity probe.
    pub probe_interval: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            sync_interval: Duration::from_secs(60),
            probe_interval: Duration::from_secs(30),
        }
    }
}

impl SyncPolicy {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Whether a mutation with `attempts` failed tries should be abandoned.
    pub fn exceeds_ceiling(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Delay before the next periodic cycle after `consecutive_failures`
    /// failed ones: `base * 2^(n-1)`, capped at `max_delay`.
    pub fn backoff_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exp = (consecutive_failures - 1).min(20);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Everything the agent needs to talk to the API and persist offline writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineConfig {
    pub api_url: String,
    pub api_token: Option<String>,
    /// `None` means the per-user default location.
    pub db_path: Option<PathBuf>,
    pub request_timeout: Duration,
    pub ping_path: String,
    pub policy: SyncPolicy,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".to_string(),
            api_token: None,
            db_path: None,
            request_timeout: Duration::from_secs(20),
            ping_path: "/api/method/ping".to_string(),
            policy: SyncPolicy::default(),
        }
    }
}

impl OfflineConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let policy = SyncPolicy::default();

        let secs = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse_or(&lookup, key, None::<u64>)?
                .map(Duration::from_secs)
                .unwrap_or(default))
        };
        let interval = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            let value = secs(key, default)?;
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    key,
                    value: "0".to_string(),
                });
            }
            Ok(value)
        };

        let policy = SyncPolicy {
            batch_size: parse_or(&lookup, "ERPSYNC_BATCH_SIZE", Some(policy.batch_size))?
                .unwrap_or(policy.batch_size)
                .max(1),
            max_attempts: parse_or(&lookup, "ERPSYNC_MAX_ATTEMPTS", Some(policy.max_attempts))?
                .unwrap_or(policy.max_attempts)
                .max(1),
            base_delay: secs("ERPSYNC_BACKOFF_BASE_SECS", policy.base_delay)?,
            max_delay: secs("ERPSYNC_BACKOFF_MAX_SECS", policy.max_delay)?,
            sync_interval: interval("ERPSYNC_SYNC_INTERVAL_SECS", policy.sync_interval)?,
            probe_interval: interval("ERPSYNC_PROBE_INTERVAL_SECS", policy.probe_interval)?,
        };

        Ok(Self {
            api_url: lookup("ERPSYNC_API_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_url),
            api_token: lookup("ERPSYNC_API_TOKEN").filter(|t| !t.is_empty()),
            db_path: lookup("ERPSYNC_DB_PATH").map(PathBuf::from),
            request_timeout: interval("ERPSYNC_REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            ping_path: lookup("ERPSYNC_PING_PATH").unwrap_or(defaults.ping_path),
            policy,
        })
    }
}

fn parse_or<T, F>(lookup: &F, key: &'static str, default: Option<T>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}
