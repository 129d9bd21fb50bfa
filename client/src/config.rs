//! Retry, backoff and polling tunables for the client.

use shared::framing::FrameConfig;
use std::time::Duration;

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry. Default: 500 ms.
    pub base_delay: Duration,
    /// Factor applied to the delay after each retry. Default: 2.0.
    pub multiplier: f64,
    /// Upper bound for any single delay. Default: 8 s.
    pub max_delay: Duration,
    /// Retries after the first attempt before giving up. Default: 6.
    pub max_retries: u32,
    /// Random spread applied as ±jitter × delay (0.0 to 1.0). Default: 0.1.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(8),
            max_retries: 6,
            jitter: 0.1,
        }
    }
}

/// Fixed-delay retry for a single call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Pause after a successful poll. Default: 200 ms.
    pub interval: Duration,
    /// Backoff unit after a failure, multiplied by the consecutive failure count. Default: 1 s.
    pub failure_backoff: Duration,
    /// Consecutive failures after which polling stops for good. Default: 10.
    pub max_consecutive_failures: u32,
}

impl PollConfig {
    pub fn failure_delay(&self, consecutive_failures: u32) -> Duration {
        self.failure_backoff.saturating_mul(consecutive_failures)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            failure_backoff: Duration::from_secs(1),
            max_consecutive_failures: 10,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub register: RetryPolicy,
    pub moves: RetryPolicy,
    pub poll: PollConfig,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect: BackoffConfig,
    /// Fresh connections tried when registration keeps failing. Default: 3.
    pub registration_rounds: u32,
    pub session: SessionConfig,
    pub frame: FrameConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect: BackoffConfig::default(),
            registration_rounds: 3,
            session: SessionConfig::default(),
            frame: FrameConfig::default(),
        }
    }
}
