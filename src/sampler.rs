//! Adaptive per-metric sampling
//!
//! Decides whether a fresh reading is worth transmitting: a reading is
//! send-worthy when it moved more than the metric's change threshold
//! since the last accepted value, or when the heartbeat interval has
//! elapsed without a send.

use crate::clock::Clock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on tracked metrics
pub const MAX_TRACKED_METRICS: usize = 16;

/// A single reading from a sensor collaborator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    /// Metric identifier (e.g. "temp", "humidity")
    pub metric: String,
    /// Measured value
    pub value: f64,
    /// Capture time in milliseconds
    pub timestamp: u64,
}

impl SensorReading {
    /// Create a new reading
    pub fn new(metric: impl Into<String>, value: f64, timestamp: u64) -> Self {
        Self {
            metric: metric.into(),
            value,
            timestamp,
        }
    }
}

/// Sampler tuning
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Change threshold applied to metrics without an explicit one
    pub default_threshold: f64,
    /// Maximum silence per metric before a value is sent regardless
    pub heartbeat: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            default_threshold: 0.5,
            heartbeat: Duration::from_secs(60),
        }
    }
}

/// Per-metric sampling state, mutated only by [`AdaptiveSampler::evaluate`]
#[derive(Debug, Clone)]
struct SampleState {
    last_sent_value: f64,
    last_send_ms: u64,
    threshold: f64,
}

/// Send-worthiness gate, one state per registered metric
///
/// Purely local decision logic: no I/O, no failure mode beyond input
/// validation. Unknown metrics evaluate to false without side effects.
pub struct AdaptiveSampler {
    config: SamplerConfig,
    states: HashMap<String, SampleState>,
    clock: Arc<dyn Clock>,
}

impl AdaptiveSampler {
    /// Create a sampler with default tuning
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(SamplerConfig::default(), clock)
    }

    /// Create a sampler with custom tuning
    pub fn with_config(config: SamplerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            states: HashMap::new(),
            clock,
        }
    }

    /// Register a metric with the default change threshold
    ///
    /// Returns false when the metric table is full.
    pub fn register(&mut self, metric: impl Into<String>) -> bool {
        let threshold = self.config.default_threshold;
        self.register_with_threshold(metric, threshold)
    }

    /// Register a metric with an explicit change threshold
    pub fn register_with_threshold(&mut self, metric: impl Into<String>, threshold: f64) -> bool {
        let metric = metric.into();
        if let Some(state) = self.states.get_mut(&metric) {
            state.threshold = threshold;
            return true;
        }
        if self.states.len() >= MAX_TRACKED_METRICS {
            log::warn!(
                "sampler: metric table full ({}), ignoring '{}'",
                MAX_TRACKED_METRICS,
                metric
            );
            return false;
        }
        self.states.insert(
            metric,
            SampleState {
                last_sent_value: 0.0,
                last_send_ms: 0,
                threshold,
            },
        );
        true
    }

    /// Adjust the change threshold of an already-registered metric
    pub fn set_threshold(&mut self, metric: &str, threshold: f64) -> bool {
        match self.states.get_mut(metric) {
            Some(state) => {
                state.threshold = threshold;
                true
            }
            None => false,
        }
    }

    /// Decide whether `new_value` for `metric` is worth transmitting
    ///
    /// Accepts when `|new_value - last_sent| > threshold` or when the
    /// heartbeat interval elapsed since the last accepted value; on
    /// acceptance the tracked state is updated to the new value.
    pub fn evaluate(&mut self, metric: &str, new_value: f64) -> bool {
        if !new_value.is_finite() {
            log::warn!("sampler: non-finite value for '{}', rejected", metric);
            return false;
        }

        let now = self.clock.now_ms();
        let heartbeat_ms = self.config.heartbeat.as_millis() as u64;

        let Some(state) = self.states.get_mut(metric) else {
            log::debug!("sampler: unknown metric '{}', rejected", metric);
            return false;
        };

        let delta = (new_value - state.last_sent_value).abs();
        let silence = now.saturating_sub(state.last_send_ms);

        if delta > state.threshold || silence > heartbeat_ms {
            state.last_sent_value = new_value;
            state.last_send_ms = now;
            true
        } else {
            false
        }
    }

    /// Number of registered metrics
    pub fn metric_count(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn sampler_with_clock() -> (AdaptiveSampler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at(1));
        let sampler = AdaptiveSampler::new(clock.clone());
        (sampler, clock)
    }

    #[test]
    fn test_threshold_gate() {
        let (mut sampler, _clock) = sampler_with_clock();
        sampler.register("temp");

        // First jump past the default 0.5 threshold from the initial 0.0
        assert!(sampler.evaluate("temp", 1.0));
        // Small wiggle below threshold
        assert!(!sampler.evaluate("temp", 1.3));
        // Exactly at threshold is not enough (strict inequality)
        assert!(!sampler.evaluate("temp", 1.5));
        // Past it again
        assert!(sampler.evaluate("temp", 1.6));
    }

    #[test]
    fn test_accept_updates_last_sent() {
        let (mut sampler, _clock) = sampler_with_clock();
        sampler.register("temp");

        assert!(sampler.evaluate("temp", 2.0));
        // Relative to 2.0 now, not 0.0
        assert!(!sampler.evaluate("temp", 2.4));
        assert!(sampler.evaluate("temp", 2.6));
    }

    #[test]
    fn test_heartbeat_forces_send() {
        let (mut sampler, clock) = sampler_with_clock();
        sampler.register("temp");

        assert!(sampler.evaluate("temp", 1.0));
        assert!(!sampler.evaluate("temp", 1.1));

        clock.advance(60_001);
        // No qualifying change, but heartbeat elapsed
        assert!(sampler.evaluate("temp", 1.1));
        // And the window restarts
        assert!(!sampler.evaluate("temp", 1.2));
    }

    #[test]
    fn test_per_metric_threshold() {
        let (mut sampler, _clock) = sampler_with_clock();
        sampler.register_with_threshold("pressure", 2.0);
        sampler.register("temp");

        assert!(!sampler.evaluate("pressure", 1.5));
        assert!(sampler.evaluate("pressure", 2.5));
        assert!(sampler.evaluate("temp", 0.6));
    }

    #[test]
    fn test_unknown_metric_rejected() {
        let (mut sampler, _clock) = sampler_with_clock();
        assert!(!sampler.evaluate("ghost", 99.0));
        assert_eq!(sampler.metric_count(), 0);
    }

    #[test]
    fn test_metric_table_cap() {
        let (mut sampler, _clock) = sampler_with_clock();
        for i in 0..MAX_TRACKED_METRICS {
            assert!(sampler.register(format!("m{}", i)));
        }
        assert!(!sampler.register("one-too-many"));
        // Re-registering an existing metric still works
        assert!(sampler.register("m0"));
        assert_eq!(sampler.metric_count(), MAX_TRACKED_METRICS);
    }

    #[test]
    fn test_non_finite_rejected() {
        let (mut sampler, _clock) = sampler_with_clock();
        sampler.register("temp");
        assert!(!sampler.evaluate("temp", f64::NAN));
        assert!(!sampler.evaluate("temp", f64::INFINITY));
    }
}
