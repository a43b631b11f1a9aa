//! Agent orchestration
//!
//! [`UplinkAgent`] wires the pipeline together: readings pass the
//! adaptive sampler into the batcher; flushed batches go through the
//! delta encoder into the priority queue; the send pump delivers queued
//! payloads over the uplink under the retry policy, spilling to the
//! overflow store when retries run out or the queue refuses an entry.
//!
//! The agent is single-threaded by design: the owner calls
//! [`tick`](UplinkAgent::tick) from its main loop and every stage does a
//! bounded amount of work per call. Nothing in `tick` sleeps; only
//! [`drain_overflow`](UplinkAgent::drain_overflow) blocks, since it runs
//! when connectivity has just returned and catching up is the priority.

use crate::batcher::SmartBatcher;
use crate::clock::Clock;
use crate::config::AgentConfig;
use crate::delta::{DeltaEncoder, DeltaPayload};
use crate::error::Result;
use crate::monitor::{NetworkMonitor, NetworkStats};
use crate::queue::{PopOutcome, Priority, PriorityQueue, PushOutcome};
use crate::retry::{RetryConfig, RetryManager};
use crate::sampler::{AdaptiveSampler, SensorReading};
use crate::store::{DrainReport, OverflowStore};
use crate::transport::Uplink;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::thread;

/// Observed health of the upstream link
#[derive(Debug, Clone, Default)]
pub struct ConnectionStatus {
    /// Whether the most recent delivery attempt succeeded
    pub link_up: bool,
    /// Clock time of the last successful delivery
    pub last_success_ms: Option<u64>,
    /// Failed attempts since the last success
    pub consecutive_failures: u32,
}

/// A serialized payload paired with the snapshot its delivery would
/// acknowledge
///
/// The snapshot rides with the payload through the queue so that a
/// success commits exactly the state of the payload that reached the
/// server. An entry that is evicted, refused, or spilled takes its
/// snapshot down with it and nothing is committed.
#[derive(Debug, Clone)]
struct Outbound {
    payload: Vec<u8>,
    commit: Option<(Map<String, Value>, bool)>,
}

impl Outbound {
    fn event(payload: Vec<u8>) -> Self {
        Self {
            payload,
            commit: None,
        }
    }
}

/// The full telemetry pipeline behind one uplink
pub struct UplinkAgent<U: Uplink> {
    sampler: AdaptiveSampler,
    batcher: SmartBatcher,
    delta: DeltaEncoder,
    queue: PriorityQueue<Outbound>,
    retry: RetryManager,
    retry_config: RetryConfig,
    monitor: NetworkMonitor,
    store: OverflowStore,
    uplink: U,
    status: ConnectionStatus,
    /// Entry currently being retried
    in_flight: Option<Outbound>,
    /// Entry deferred because the queue lock was contended
    stash: Option<(Outbound, Priority)>,
    last_send_ms: Option<u64>,
    min_send_interval_ms: u64,
    clock: Arc<dyn Clock>,
}

impl<U: Uplink> UplinkAgent<U> {
    /// Create an agent with the system clock
    pub fn new(config: AgentConfig, uplink: U) -> Self {
        Self::with_clock(config, uplink, crate::clock::system_clock())
    }

    /// Create an agent observing the given clock
    pub fn with_clock(config: AgentConfig, uplink: U, clock: Arc<dyn Clock>) -> Self {
        Self {
            sampler: AdaptiveSampler::with_config(config.sampler, Arc::clone(&clock)),
            batcher: SmartBatcher::with_config(config.batch, Arc::clone(&clock)),
            delta: DeltaEncoder::with_config(config.delta, Arc::clone(&clock)),
            queue: PriorityQueue::with_capacity(config.queue_capacity, Arc::clone(&clock)),
            retry: RetryManager::with_config(config.retry.clone(), Arc::clone(&clock)),
            retry_config: config.retry,
            monitor: NetworkMonitor::with_config(config.monitor, Arc::clone(&clock)),
            store: OverflowStore::with_config(config.store),
            uplink,
            status: ConnectionStatus::default(),
            in_flight: None,
            stash: None,
            last_send_ms: None,
            min_send_interval_ms: config.min_send_interval.as_millis() as u64,
            clock,
        }
    }

    /// Track a metric with the default change threshold
    pub fn register_metric(&mut self, metric: &str) -> bool {
        self.sampler.register(metric)
    }

    /// Track a metric with a custom change threshold
    pub fn register_metric_with_threshold(&mut self, metric: &str, threshold: f64) -> bool {
        self.sampler.register_with_threshold(metric, threshold)
    }

    /// Offer one reading to the pipeline
    ///
    /// Returns true when the sampler accepted the value and it entered
    /// the current batch.
    pub fn offer_reading(&mut self, metric: &str, value: f64) -> bool {
        if !self.sampler.evaluate(metric, value) {
            return false;
        }
        let reading = SensorReading::new(metric, value, self.clock.now_ms());
        if !self.batcher.add(&reading) {
            log::debug!("agent: batcher busy, reading dropped");
            return false;
        }
        true
    }

    /// Enqueue a pre-serialized event, bypassing sampler and batcher
    ///
    /// Meant for alarms and state changes that must not wait out the
    /// batch triggers.
    pub fn submit_event(&mut self, payload: Vec<u8>, priority: Priority) -> Result<()> {
        self.enqueue(Outbound::event(payload), priority)
    }

    /// Advance the pipeline by one bounded step
    ///
    /// Emits a periodic stats report, retries any stashed enqueue,
    /// flushes the batch when a trigger fired, and attempts at most one
    /// delivery.
    pub fn tick(&mut self) -> Result<()> {
        self.monitor.check_and_report();

        if let Some((outbound, priority)) = self.stash.take() {
            self.enqueue(outbound, priority)?;
        }

        if self.batcher.should_flush() {
            self.flush_batch()?;
        }

        self.pump_send()
    }

    /// Flush the batch regardless of triggers and attempt delivery
    ///
    /// For shutdown paths that must not leave readings behind.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_batch()?;
        self.pump_send()
    }

    /// Resend everything in the overflow store, blocking between retries
    ///
    /// Each chunk gets its own fresh backoff schedule; the pass aborts
    /// at the first chunk that exhausts it. The log file survives any
    /// pass that was not fully clean.
    pub fn drain_overflow(&mut self) -> Result<DrainReport> {
        if !self.store.exists() {
            return Ok(DrainReport::default());
        }
        log::info!("agent: draining overflow store");

        let uplink = &mut self.uplink;
        let monitor = &mut self.monitor;
        let clock = &self.clock;
        let policy_config = &self.retry_config;

        let report = self.store.drain_and_resend(|chunk| {
            let mut policy = RetryManager::with_config(policy_config.clone(), Arc::clone(clock));
            loop {
                let attempt = uplink.push(chunk.as_bytes());
                monitor.record_request(
                    attempt.bytes_sent,
                    attempt.bytes_received,
                    attempt.elapsed_ms,
                    attempt.success,
                );
                if attempt.success {
                    return true;
                }
                policy.record_failure();
                if policy.exhausted() {
                    return false;
                }
                thread::sleep(policy.remaining_delay());
            }
        })?;

        if report.chunks_failed > 0 {
            self.status.link_up = false;
        } else if report.chunks_sent > 0 {
            self.status.link_up = true;
            self.status.last_success_ms = Some(self.clock.now_ms());
            self.status.consecutive_failures = 0;
        }
        Ok(report)
    }

    /// Link health as of the last delivery attempt
    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// Traffic counters
    pub fn stats(&self) -> &NetworkStats {
        self.monitor.stats()
    }

    /// Entries waiting in the in-memory queue
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Readings accumulated in the current batch
    pub fn batch_len(&self) -> usize {
        self.batcher.len()
    }

    /// Whether the overflow store holds undelivered payloads
    pub fn overflow_pending(&self) -> bool {
        self.store.exists()
    }

    /// The uplink behind the pipeline
    pub fn uplink(&self) -> &U {
        &self.uplink
    }

    fn flush_batch(&mut self) -> Result<()> {
        let Some(snapshot) = self.batcher.drain() else {
            return Ok(());
        };

        let (bytes, full) = match self.delta.encode(&snapshot)? {
            DeltaPayload::Full(bytes) => (bytes, true),
            DeltaPayload::Delta(bytes) => (bytes, false),
            DeltaPayload::Unchanged => {
                log::debug!("agent: batch unchanged since last send, skipped");
                return Ok(());
            }
        };

        let outbound = Outbound {
            payload: bytes,
            commit: Some((snapshot, full)),
        };
        self.enqueue(outbound, Priority::Normal)
    }

    fn enqueue(&mut self, outbound: Outbound, priority: Priority) -> Result<()> {
        match self.queue.push(outbound.clone(), priority) {
            PushOutcome::Stored => Ok(()),
            PushOutcome::StoredEvicted => {
                log::warn!("agent: queue full, oldest normal entry evicted");
                Ok(())
            }
            PushOutcome::Refused => {
                log::warn!("agent: queue refused {} payload, spilling to store", priority);
                self.spill(&outbound.payload)
            }
            PushOutcome::Busy => {
                self.stash = Some((outbound, priority));
                Ok(())
            }
        }
    }

    fn pump_send(&mut self) -> Result<()> {
        if self.in_flight.is_none() {
            match self.queue.pop() {
                PopOutcome::Entry(entry) => self.in_flight = Some(entry.payload),
                PopOutcome::Empty | PopOutcome::Busy => return Ok(()),
            }
        }

        let now = self.clock.now_ms();
        if let Some(last) = self.last_send_ms {
            if now.saturating_sub(last) < self.min_send_interval_ms {
                return Ok(());
            }
        }
        if !self.retry.can_retry() {
            // Backoff window still open
            return Ok(());
        }

        let report = match self.in_flight.as_ref() {
            Some(outbound) => self.uplink.push(&outbound.payload),
            None => return Ok(()),
        };

        self.last_send_ms = Some(now);
        self.monitor.record_request(
            report.bytes_sent,
            report.bytes_received,
            report.elapsed_ms,
            report.success,
        );

        if report.success {
            self.status.link_up = true;
            self.status.last_success_ms = Some(now);
            self.status.consecutive_failures = 0;
            self.retry.record_success();
            if let Some(outbound) = self.in_flight.take() {
                if let Some((snapshot, full)) = outbound.commit {
                    self.delta.commit(&snapshot, full);
                }
            }
            log::info!("agent: payload delivered (status {})", report.status);
        } else {
            self.status.link_up = false;
            self.status.consecutive_failures += 1;
            self.retry.record_failure();
            if self.retry.exhausted() {
                if let Some(outbound) = self.in_flight.take() {
                    log::warn!("agent: retries exhausted, payload spilled to store");
                    self.spill(&outbound.payload)?;
                }
                self.retry.reset();
            }
        }
        Ok(())
    }

    fn spill(&self, payload: &[u8]) -> Result<()> {
        self.store.append(&String::from_utf8_lossy(payload))?;
        Ok(())
    }
}
