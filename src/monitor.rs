//! Network usage counters and periodic reporting
//!
//! Cumulative per-attempt accounting: bytes moved, request outcomes,
//! latency. Counters only grow between explicit resets; a reset starts
//! a new epoch.

use crate::clock::Clock;
use std::sync::Arc;
use std::time::Duration;

/// Reporting cadence
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Minimum spacing between emitted reports
    pub report_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_secs(300),
        }
    }
}

/// Cumulative counters since the last reset
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkStats {
    /// Total bytes written to the transport
    pub bytes_sent: u64,
    /// Total bytes read from the transport
    pub bytes_received: u64,
    /// Total delivery attempts
    pub total_requests: u64,
    /// Attempts that ended in a confirmed success
    pub successful_requests: u64,
    /// Attempts that ended in any failure
    pub failed_requests: u64,
    /// Sum of per-attempt latencies in milliseconds
    pub total_latency_ms: u64,
}

impl NetworkStats {
    /// Success rate in percent (0.0 when no requests were made)
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64 * 100.0
    }

    /// Average attempt latency in milliseconds
    pub fn average_latency_ms(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.total_latency_ms as f64 / self.total_requests as f64
    }
}

/// Observes every transport attempt and reports at a bounded rate
pub struct NetworkMonitor {
    stats: NetworkStats,
    config: MonitorConfig,
    epoch_ms: u64,
    last_report_ms: u64,
    clock: Arc<dyn Clock>,
}

impl NetworkMonitor {
    /// Create a monitor with the default 5-minute reporting interval
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(MonitorConfig::default(), clock)
    }

    /// Create a monitor with a custom reporting interval
    pub fn with_config(config: MonitorConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        Self {
            stats: NetworkStats::default(),
            config,
            epoch_ms: now,
            last_report_ms: now,
            clock,
        }
    }

    /// Record one delivery attempt
    pub fn record_request(
        &mut self,
        bytes_sent: u64,
        bytes_received: u64,
        latency_ms: u64,
        success: bool,
    ) {
        self.stats.bytes_sent += bytes_sent;
        self.stats.bytes_received += bytes_received;
        self.stats.total_requests += 1;
        self.stats.total_latency_ms += latency_ms;
        if success {
            self.stats.successful_requests += 1;
        } else {
            self.stats.failed_requests += 1;
        }
    }

    /// Emit a report if the reporting interval elapsed
    ///
    /// Returns the snapshot that was reported, or None when the
    /// interval has not yet passed.
    pub fn check_and_report(&mut self) -> Option<NetworkStats> {
        let now = self.clock.now_ms();
        if now.saturating_sub(self.last_report_ms) <= self.config.report_interval.as_millis() as u64
        {
            return None;
        }
        self.last_report_ms = now;
        log::info!("{}", self.report());
        Some(self.stats.clone())
    }

    /// Current counters
    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    /// Seconds since the current epoch started
    pub fn uptime_secs(&self) -> u64 {
        self.clock.now_ms().saturating_sub(self.epoch_ms) / 1000
    }

    /// Clear all counters and start a new epoch
    pub fn reset(&mut self) {
        self.stats = NetworkStats::default();
        self.epoch_ms = self.clock.now_ms();
        self.last_report_ms = self.epoch_ms;
    }

    /// Generate a human-readable report
    pub fn report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Network Statistics ===\n");
        report.push_str(&format!(
            "Requests: {} ({:.1}% success)\n",
            self.stats.total_requests,
            self.stats.success_rate()
        ));
        report.push_str(&format!(
            "Sent: {:.1} KB, Received: {:.1} KB\n",
            self.stats.bytes_sent as f64 / 1024.0,
            self.stats.bytes_received as f64 / 1024.0
        ));
        if self.stats.total_requests > 0 {
            report.push_str(&format!(
                "Average latency: {:.0} ms\n",
                self.stats.average_latency_ms()
            ));
        }
        report.push_str(&format!("Uptime: {} seconds", self.uptime_secs()));

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use approx::assert_relative_eq;

    fn monitor_with_clock() -> (NetworkMonitor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let monitor = NetworkMonitor::new(clock.clone());
        (monitor, clock)
    }

    #[test]
    fn test_counters_accumulate() {
        let (mut monitor, _clock) = monitor_with_clock();

        monitor.record_request(512, 128, 80, true);
        monitor.record_request(256, 0, 4000, false);
        monitor.record_request(512, 130, 120, true);

        let stats = monitor.stats();
        assert_eq!(stats.bytes_sent, 1280);
        assert_eq!(stats.bytes_received, 258);
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.successful_requests, 2);
        assert_eq!(stats.failed_requests, 1);
        assert_relative_eq!(stats.success_rate(), 66.666, epsilon = 0.01);
        assert_relative_eq!(stats.average_latency_ms(), 1400.0, epsilon = 0.01);
    }

    #[test]
    fn test_report_rate_limited() {
        let (mut monitor, clock) = monitor_with_clock();
        monitor.record_request(100, 50, 10, true);

        assert!(monitor.check_and_report().is_none());

        clock.advance(300_001);
        let snapshot = monitor.check_and_report().expect("report due");
        assert_eq!(snapshot.total_requests, 1);

        // Immediately after, the interval gate closes again
        assert!(monitor.check_and_report().is_none());
    }

    #[test]
    fn test_reset_starts_new_epoch() {
        let (mut monitor, clock) = monitor_with_clock();
        monitor.record_request(100, 50, 10, true);
        clock.advance(30_000);

        assert_eq!(monitor.uptime_secs(), 30);
        monitor.reset();

        assert_eq!(monitor.stats(), &NetworkStats::default());
        assert_eq!(monitor.uptime_secs(), 0);
    }

    #[test]
    fn test_empty_stats() {
        let (monitor, _clock) = monitor_with_clock();
        assert_eq!(monitor.stats().success_rate(), 0.0);
        assert_eq!(monitor.stats().average_latency_ms(), 0.0);
    }

    #[test]
    fn test_report_contents() {
        let (mut monitor, _clock) = monitor_with_clock();
        monitor.record_request(2048, 256, 90, true);

        let report = monitor.report();
        assert!(report.contains("Requests: 1"));
        assert!(report.contains("100.0% success"));
        assert!(report.contains("2.0 KB"));
    }
}
