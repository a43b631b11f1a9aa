//! Exponential-backoff retry scheduling
//!
//! One [`RetryManager`] governs one in-flight delivery operation: it
//! gates when the next attempt may run and tracks how many attempts
//! were spent. Exhaustion is a routing signal (send the payload to the
//! overflow store), not an error.

use crate::clock::Clock;
use std::sync::Arc;
use std::time::Duration;

/// Backoff policy
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per delivery operation
    pub max_retries: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Cap applied to the computed delay
    pub max_delay: Duration,
    /// Growth factor per failure
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(30_000),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff delay after the given failure count (1-indexed)
    ///
    /// `initial_delay * multiplier^(failures - 1)`, capped at `max_delay`.
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(failures as i32 - 1);
        Duration::from_millis(ms as u64).min(self.max_delay)
    }
}

/// Stateful backoff gate for one delivery operation
pub struct RetryManager {
    config: RetryConfig,
    attempts: u32,
    next_eligible_ms: u64,
    clock: Arc<dyn Clock>,
}

impl RetryManager {
    /// Create a manager with the default policy
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(RetryConfig::default(), clock)
    }

    /// Create a manager with a custom policy
    pub fn with_config(config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            attempts: 0,
            next_eligible_ms: 0,
            clock,
        }
    }

    /// Whether an attempt may run now
    ///
    /// True iff the attempt budget is not exhausted and the backoff
    /// delay from the previous failure has elapsed.
    pub fn can_retry(&self) -> bool {
        if self.attempts >= self.config.max_retries {
            return false;
        }
        self.clock.now_ms() >= self.next_eligible_ms
    }

    /// Whether the attempt budget is spent
    pub fn exhausted(&self) -> bool {
        self.attempts >= self.config.max_retries
    }

    /// Milliseconds until the next attempt becomes eligible
    pub fn remaining_delay(&self) -> Duration {
        Duration::from_millis(self.next_eligible_ms.saturating_sub(self.clock.now_ms()))
    }

    /// Record a failed attempt and schedule the next one
    ///
    /// The attempt count saturates at `max_retries`.
    pub fn record_failure(&mut self) {
        self.attempts = (self.attempts + 1).min(self.config.max_retries);
        let delay = self.config.delay_after(self.attempts);
        self.next_eligible_ms = self.clock.now_ms() + delay.as_millis() as u64;
        log::info!(
            "retry: attempt {}/{} failed, next eligible in {}ms",
            self.attempts,
            self.config.max_retries,
            delay.as_millis()
        );
    }

    /// Record a successful attempt; the operation is complete
    pub fn record_success(&mut self) {
        if self.attempts > 0 {
            log::info!("retry: succeeded after {} failed attempts", self.attempts);
        }
        self.reset();
    }

    /// Reset for a new delivery operation
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_eligible_ms = 0;
    }

    /// Failed attempts recorded so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manager_with_clock() -> (RetryManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let manager = RetryManager::new(clock.clone());
        (manager, clock)
    }

    #[test]
    fn test_default_delay_ladder() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_after(1), Duration::from_millis(500));
        assert_eq!(config.delay_after(2), Duration::from_millis(1000));
        assert_eq!(config.delay_after(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_delay_cap() {
        let config = RetryConfig {
            max_retries: 10,
            ..Default::default()
        };
        // 500 * 2^9 = 256000ms, capped at 30s
        assert_eq!(config.delay_after(10), Duration::from_millis(30_000));
    }

    #[test]
    fn test_backoff_gates_eligibility() {
        let (mut manager, clock) = manager_with_clock();
        assert!(manager.can_retry());

        manager.record_failure();
        assert!(!manager.can_retry());
        assert_eq!(manager.remaining_delay(), Duration::from_millis(500));

        clock.advance(499);
        assert!(!manager.can_retry());
        clock.advance(1);
        assert!(manager.can_retry());
    }

    #[test]
    fn test_exhaustion_after_max_retries() {
        let (mut manager, clock) = manager_with_clock();

        for _ in 0..3 {
            manager.record_failure();
            clock.advance(60_000);
        }

        assert!(manager.exhausted());
        assert!(!manager.can_retry(), "4th attempt must be denied");
        assert_eq!(manager.attempts(), 3);

        // Saturation: further failures do not grow the count
        manager.record_failure();
        assert_eq!(manager.attempts(), 3);
    }

    #[test]
    fn test_success_resets() {
        let (mut manager, clock) = manager_with_clock();
        manager.record_failure();
        manager.record_failure();
        clock.advance(10_000);

        manager.record_success();
        assert_eq!(manager.attempts(), 0);
        assert!(manager.can_retry());
        assert_eq!(manager.remaining_delay(), Duration::ZERO);
    }
}
