use std::env;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;

/// Retry schedule for automatic reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before giving up; never less than one.
    pub max_attempts: u32,
    /// Countdown before the first automatic attempt.
    pub initial_delay: Duration,
    pub backoff_multiplier: u32,
    /// Upper bound for any countdown.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl ReconnectPolicy {
    /// Load the policy from `CONN_RECONNECT_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_attempts = env_parse("CONN_RECONNECT_MAX_ATTEMPTS")
            .unwrap_or(defaults.max_attempts)
            .max(1);
        let initial_delay = env_parse("CONN_RECONNECT_INITIAL_DELAY_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.initial_delay);
        let max_delay = env_parse("CONN_RECONNECT_MAX_DELAY_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_delay)
            .max(initial_delay);
        Self {
            max_attempts,
            initial_delay,
            backoff_multiplier: defaults.backoff_multiplier,
            max_delay,
        }
    }

    /// Countdown to wait after `failed_attempts` consecutive failures.
    pub fn backoff_after(&self, failed_attempts: u32) -> Duration {
        let factor = self.backoff_multiplier.saturating_pow(failed_attempts);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable reconnect setting");
            None
        }
    }
}
