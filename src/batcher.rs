//! Size/time/count-bounded batching of accepted readings
//!
//! Readings that pass the sampler accumulate here until one of three
//! flush triggers fires: enough readings, the batch grew old, or the
//! serialized size crossed the byte bound.

use crate::clock::Clock;
use crate::sampler::SensorReading;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Batch flush triggers
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush once this many readings have accumulated
    pub min_count: usize,
    /// Flush once the serialized readings reach this many bytes
    pub max_bytes: usize,
    /// Flush once the oldest reading in the batch is older than this
    pub timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_count: 5,
            max_bytes: 2048,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Accumulating batch state
#[derive(Debug, Default)]
struct Batch {
    items: Vec<Value>,
    first_ms: u64,
    byte_size: usize,
}

impl Batch {
    fn clear(&mut self) {
        self.items.clear();
        self.first_ms = 0;
        self.byte_size = 0;
    }
}

/// Mutex-guarded batch accumulator
///
/// All three operations take the lock non-blockingly: a contended call
/// reports "busy" and the caller simply tries again on the next pass.
/// `add` never rejects input for size reasons; the byte bound only
/// advises flush timing.
pub struct SmartBatcher {
    inner: Mutex<Batch>,
    config: BatchConfig,
    clock: Arc<dyn Clock>,
}

impl SmartBatcher {
    /// Create a batcher with default triggers
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(BatchConfig::default(), clock)
    }

    /// Create a batcher with custom triggers
    pub fn with_config(config: BatchConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Batch::default()),
            config,
            clock,
        }
    }

    /// Append a reading to the current batch
    ///
    /// Returns false only when the batch lock is contended; the reading
    /// is not consumed in that case.
    pub fn add(&self, reading: &SensorReading) -> bool {
        let Ok(mut batch) = self.inner.try_lock() else {
            log::debug!("batcher: busy, reading deferred");
            return false;
        };

        let value = match serde_json::to_value(reading) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("batcher: unserializable reading dropped: {}", e);
                return true;
            }
        };

        if batch.items.is_empty() {
            batch.first_ms = self.clock.now_ms();
        }
        batch.byte_size += value.to_string().len();
        batch.items.push(value);
        true
    }

    /// Check whether any flush trigger fired
    pub fn should_flush(&self) -> bool {
        let Ok(batch) = self.inner.try_lock() else {
            return false;
        };

        if batch.items.len() >= self.config.min_count {
            return true;
        }
        if !batch.items.is_empty()
            && self.clock.now_ms().saturating_sub(batch.first_ms)
                > self.config.timeout.as_millis() as u64
        {
            return true;
        }
        batch.byte_size >= self.config.max_bytes
    }

    /// Atomically take the batch contents and clear the accumulator
    ///
    /// Returns the batch as a JSON object snapshot
    /// `{"count": n, "timestamp": now, "data": [...]}`, or None when the
    /// batch is empty or the lock is contended.
    pub fn drain(&self) -> Option<Map<String, Value>> {
        let Ok(mut batch) = self.inner.try_lock() else {
            log::debug!("batcher: busy, drain deferred");
            return None;
        };

        if batch.items.is_empty() {
            return None;
        }

        let mut snapshot = Map::new();
        snapshot.insert("count".to_string(), json!(batch.items.len()));
        snapshot.insert("timestamp".to_string(), json!(self.clock.now_ms()));
        snapshot.insert("data".to_string(), Value::Array(std::mem::take(&mut batch.items)));
        batch.clear();

        Some(snapshot)
    }

    /// Number of readings currently batched
    pub fn len(&self) -> usize {
        self.inner.try_lock().map(|b| b.items.len()).unwrap_or(0)
    }

    /// Whether the batch is currently empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
