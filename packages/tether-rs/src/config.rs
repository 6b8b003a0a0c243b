//! Configuration for pools, transports and retry.
//!
//! Plain structs with sensible defaults. Applications that configure through
//! the environment use [`TransportConfig::from_env`].

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Environment variable for the number of broker sessions per transport.
pub const SESSION_COUNT_ENV: &str = "TETHER_SESSION_COUNT";

/// Environment variable for the pool drain timeout, in milliseconds.
pub const DRAIN_TIMEOUT_ENV: &str = "TETHER_DRAIN_TIMEOUT_MS";

/// Configuration for a [`ResourcePool`](crate::supervisor::ResourcePool).
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    /// How long `stop` waits for in-flight work before releasing resources.
    ///
    /// `None` waits indefinitely. Work still running when it elapses keeps its
    /// resource until it finishes; the resource is released then.
    pub drain_timeout: Option<Duration>,
}

impl PoolConfig {
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }
}

/// Configuration for a [`SendTransport`](crate::transport::SendTransport).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Number of broker sessions (resource slots) the transport keeps.
    pub session_count: usize,
    /// Pool settings for the session slots.
    pub pool: PoolConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            session_count: 1,
            pool: PoolConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn with_session_count(mut self, count: usize) -> Self {
        self.session_count = count.max(1);
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Load transport configuration from environment variables.
    ///
    /// Unset variables fall back to the defaults; malformed values are errors.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(raw) = env::var(SESSION_COUNT_ENV) {
            let count: usize = raw
                .parse()
                .with_context(|| format!("{} must be a positive integer", SESSION_COUNT_ENV))?;
            config = config.with_session_count(count);
        }

        if let Ok(raw) = env::var(DRAIN_TIMEOUT_ENV) {
            let millis: u64 = raw
                .parse()
                .with_context(|| format!("{} must be a number of milliseconds", DRAIN_TIMEOUT_ENV))?;
            config.pool = config.pool.with_drain_timeout(Duration::from_millis(millis));
        }

        Ok(config)
    }
}

/// Configuration for a [`RetryFilter`](crate::filters::RetryFilter).
#[derive(Debug, Clone, Default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub retry_limit: u32,
    /// Delay before each retry. The last interval repeats; empty means immediate.
    pub intervals: Vec<Duration>,
}

impl RetryConfig {
    /// Retry immediately, up to `limit` times.
    pub fn immediate(limit: u32) -> Self {
        Self {
            retry_limit: limit,
            intervals: Vec::new(),
        }
    }

    /// Retry up to `limit` times, waiting `interval` before each.
    pub fn interval(limit: u32, interval: Duration) -> Self {
        Self {
            retry_limit: limit,
            intervals: vec![interval],
        }
    }

    /// Retry once per interval, in order.
    pub fn intervals(intervals: Vec<Duration>) -> Self {
        Self {
            retry_limit: intervals.len() as u32,
            intervals,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        let last = self.intervals.len().checked_sub(1)?;
        let index = (attempt.saturating_sub(1) as usize).min(last);
        let delay = self.intervals[index];
        (!delay.is_zero()).then_some(delay)
    }
}
