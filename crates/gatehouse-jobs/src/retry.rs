//! Retry policy: exponential backoff with additive jitter.

use gatehouse_core::ConfigError;
use rand::Rng;
use std::time::Duration;

/// Retry policy applied when a handler fails.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling on the computed delay.
    pub max_delay: Duration,
    /// Maximum handler invocations per job (initial attempt included),
    /// unless the job carries its own override.
    pub max_attempts: u32,
    /// Growth factor between attempts.
    pub backoff_factor: f64,
    /// Adds a uniform random fraction (up to a tenth of the delay) so
    /// retries from a burst of failures do not land together.
    pub enable_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
            max_attempts: 3,
            backoff_factor: 2.0,
            enable_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Validates the policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay.is_zero() {
            return Err(ConfigError::NonPositive { field: "base_delay" });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::NonPositive {
                field: "max_attempts",
            });
        }
        if self.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid {
                field: "backoff_factor",
                reason: "must be at least 1.0".to_string(),
            });
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let scaled = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent as i32);
        let mut delay = Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()));

        if self.enable_jitter && !delay.is_zero() {
            let ceiling = delay.as_secs_f64() / 10.0;
            let jitter = rand::thread_rng().gen_range(0.0..ceiling.max(f64::MIN_POSITIVE));
            delay += Duration::from_secs_f64(jitter);
        }
        delay
    }
}
