//! Backoff strategies for retried operations.
//!
//! convoy retries exactly one class of failure: a version-control write that
//! lost a race for the repository lock. The strategy is configurable so slow
//! filesystems can stretch the backoff, but the default mirrors what a
//! human would do: try three times, waiting half a second, then a second.
//!
//! # Example
//!
//! ```
//! use convoy_retry::{RetryExecutor, RetryStrategyConfig, calculate_delay};
//! use std::time::Duration;
//!
//! let config = RetryStrategyConfig::lock_contention();
//! assert_eq!(calculate_delay(&config, 1), Duration::from_millis(500));
//! assert_eq!(calculate_delay(&config, 2), Duration::from_secs(1));
//!
//! let executor = RetryExecutor::new(config);
//! let out = executor.run_if(|_attempt| Ok::<_, String>("pushed"), |_err| true);
//! assert_eq!(out, Ok("pushed"));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Strategy type for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between retries
    Immediate,
    /// Delay doubles each attempt (default)
    #[default]
    Exponential,
    /// Delay grows by `base_delay` each attempt
    Linear,
    /// Same delay every attempt
    Constant,
}

/// Configuration for a retry strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    /// Strategy type for calculating delay between retries.
    #[serde(default)]
    pub strategy: RetryStrategyType,
    /// Total number of attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for backoff calculations.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Maximum delay cap for backoff.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor for randomized delays (0.0 = no jitter, 1.0 = full jitter).
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(8)
}

impl RetryStrategyConfig {
    /// Three attempts, 500ms doubling, no jitter.
    pub fn lock_contention() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: 0.0,
        }
    }
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self::lock_contention()
    }
}

/// Calculate the delay to wait after a failed attempt.
///
/// `attempt` is 1-indexed: the delay after the first failure is
/// `calculate_delay(config, 1)`.
///
/// ```
/// use convoy_retry::{RetryStrategyConfig, RetryStrategyType, calculate_delay};
/// use std::time::Duration;
///
/// let config = RetryStrategyConfig {
///     strategy: RetryStrategyType::Linear,
///     base_delay: Duration::from_secs(1),
///     max_delay: Duration::from_secs(60),
///     jitter: 0.0,
///     max_attempts: 10,
/// };
///
/// assert_eq!(calculate_delay(&config, 3), Duration::from_secs(3));
/// ```
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategyType::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Jitter factor of 0.5 means delay * (0.5 to 1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    let random_factor = 1.0 - jitter + (rand::random::<f64>() * 2.0 * jitter);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}

/// Runs a fallible operation under a [`RetryStrategyConfig`].
pub struct RetryExecutor {
    config: RetryStrategyConfig,
    sleep: Box<dyn Fn(Duration) + Send + Sync>,
}

impl RetryExecutor {
    pub fn new(config: RetryStrategyConfig) -> Self {
        Self {
            config,
            sleep: Box::new(std::thread::sleep),
        }
    }

    /// Replace the sleeping function, e.g. with one that wakes early on
    /// cancellation or with a no-op in tests.
    pub fn with_sleep(mut self, sleep: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    pub fn config(&self) -> &RetryStrategyConfig {
        &self.config
    }

    /// Execute `operation`, retrying only the errors `retryable` accepts.
    ///
    /// The operation receives the current attempt number (starting at 1).
    /// A non-retryable error, or any error on the final attempt, is returned
    /// as-is.
    pub fn run_if<T, E, F, P>(&self, mut operation: F, retryable: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt >= max_attempts || !retryable(&e) {
                        return Err(e);
                    }

                    (self.sleep)(calculate_delay(&self.config, attempt));
                    attempt += 1;
                }
            }
        }
    }
}
