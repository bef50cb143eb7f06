use std::env;
use std::time::Duration;

/// Content-script reconnect policy: delay before attempt `n` is
/// `base_delay * 2^(n-1)`, and the bridge gives up after `max_attempts`.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_delay: env_millis("WALLET_RECONNECT_BASE_MS").unwrap_or(defaults.base_delay),
            max_attempts: env_u32("WALLET_RECONNECT_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
        }
    }
}

/// Readiness-probe policy for the remote agent: authenticated list calls
/// with doubling delay until the agent answers or the budget runs out.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: 8,
        }
    }
}

impl ProbeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_delay: env_millis("WALLET_PROBE_BASE_MS").unwrap_or(defaults.base_delay),
            max_delay: env_millis("WALLET_PROBE_MAX_DELAY_MS").unwrap_or(defaults.max_delay),
            max_attempts: env_u32("WALLET_PROBE_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
        }
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|val| val.parse().ok())
        .map(Duration::from_millis)
}

fn env_u32(var: &str) -> Option<u32> {
    env::var(var).ok().and_then(|val| val.parse().ok())
}
