//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for engine behavior.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum outbox rows fetched per drain pass.
    pub drain_batch_size: u32,
    /// Maximum secondary-store events fetched per backfill pass.
    pub backfill_batch_size: u32,
    /// Bounded timeout for a single apply round-trip.
    pub apply_timeout: Duration,
    /// Retry configuration for failed applies.
    pub retry: RetryConfig,
    /// Age after which a Pending/Processing row counts as stale for the
    /// reconciler.
    pub stale_after: Duration,
    /// Wall-clock budget for one reconciler sweep.
    pub sweep_budget: Duration,
    /// Window within which a direction's last sync counts as healthy.
    pub freshness_window: Duration,
    /// Retention for idempotency records.
    pub ledger_retention: Duration,
    /// Retention for Completed outbox rows before purge.
    pub outbox_retention: Duration,
}

impl EngineConfig {
    /// Creates the default engine configuration.
    pub fn new() -> Self {
        Self {
            drain_batch_size: 200,
            backfill_batch_size: 200,
            apply_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            stale_after: Duration::from_secs(5 * 60),
            sweep_budget: Duration::from_secs(60),
            freshness_window: Duration::from_secs(30 * 60),
            ledger_retention: Duration::from_secs(30 * 24 * 60 * 60),
            outbox_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }

    /// Sets the drain batch size.
    pub fn with_drain_batch_size(mut self, size: u32) -> Self {
        self.drain_batch_size = size;
        self
    }

    /// Sets the apply timeout.
    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the staleness threshold for the reconciler.
    pub fn with_stale_after(mut self, threshold: Duration) -> Self {
        self.stale_after = threshold;
        self
    }

    /// Sets the sweep time box.
    pub fn with_sweep_budget(mut self, budget: Duration) -> Self {
        self.sweep_budget = budget;
        self
    }

    /// Sets the health freshness window.
    pub fn with_freshness_window(mut self, window: Duration) -> Self {
        self.freshness_window = window;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of apply attempts before dead-lettering.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15 * 60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay before the given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Simple deterministic "jitter" (no external RNG dependency).
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_builder() {
        let config = EngineConfig::new()
            .with_drain_batch_size(50)
            .with_apply_timeout(Duration::from_secs(5))
            .with_stale_after(Duration::from_secs(120));

        assert_eq!(config.drain_batch_size, 50);
        assert_eq!(config.apply_timeout, Duration::from_secs(5));
        assert_eq!(config.stale_after, Duration::from_secs(120));
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        // First attempt has no delay
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        // Subsequent attempts back off exponentially; jitter adds up to 25%
        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(150));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        let delay = config.delay_for_attempt(5);
        assert!(delay <= Duration::from_millis(6250)); // 5s + 25% jitter
    }
}
