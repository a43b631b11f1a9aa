//! Delta payload encoding
//!
//! Reduces a snapshot to the fields that changed since the last
//! acknowledged send, with a periodic forced full refresh to bound
//! drift between the device's and the server's view of the state.
//!
//! Encoding is pure; the tracked state only moves via [`DeltaEncoder::commit`],
//! which the caller invokes after a provably successful transmission.

use crate::clock::Clock;
use crate::error::{Result, UplinkError};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Delta encoder tuning
#[derive(Debug, Clone)]
pub struct DeltaConfig {
    /// Maximum age of the last full send before a full refresh is forced
    pub full_interval: Duration,
    /// Fields always included in a delta even when unchanged
    pub always_include: Vec<String>,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            full_interval: Duration::from_secs(60),
            always_include: vec!["timestamp".to_string()],
        }
    }
}

/// Result of one encoding pass
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaPayload {
    /// Complete snapshot; emitted when the full-refresh interval elapsed
    Full(Vec<u8>),
    /// Only always-include and changed fields
    Delta(Vec<u8>),
    /// No field qualifies; the caller must not transmit
    Unchanged,
}

impl DeltaPayload {
    /// Serialized bytes, if there is anything to send
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Full(b) | Self::Delta(b) => Some(b),
            Self::Unchanged => None,
        }
    }

    /// Whether this is a full refresh
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

/// Tracks the last acknowledged snapshot and encodes minimal payloads
pub struct DeltaEncoder {
    config: DeltaConfig,
    last_sent: Map<String, Value>,
    last_full_ms: Option<u64>,
    clock: Arc<dyn Clock>,
}

impl DeltaEncoder {
    /// Create an encoder with default tuning
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(DeltaConfig::default(), clock)
    }

    /// Create an encoder with custom tuning
    pub fn with_config(config: DeltaConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            last_sent: Map::new(),
            last_full_ms: None,
            clock,
        }
    }

    /// Encode the current snapshot against the tracked state
    ///
    /// Does not mutate the tracked state; call [`commit`](Self::commit)
    /// once the payload has actually been delivered.
    pub fn encode(&self, snapshot: &Map<String, Value>) -> Result<DeltaPayload> {
        let now = self.clock.now_ms();
        let full_due = match self.last_full_ms {
            None => true,
            Some(last) => now.saturating_sub(last) > self.config.full_interval.as_millis() as u64,
        };

        if full_due {
            let bytes = serde_json::to_vec(snapshot)
                .map_err(|e| UplinkError::Serialize(e.to_string()))?;
            log::debug!("delta: full payload ({} bytes)", bytes.len());
            return Ok(DeltaPayload::Full(bytes));
        }

        let mut delta = Map::new();
        for (key, value) in snapshot {
            let always = self.config.always_include.iter().any(|k| k == key);
            if always || self.last_sent.get(key) != Some(value) {
                delta.insert(key.clone(), value.clone());
            }
        }

        if delta.is_empty() {
            return Ok(DeltaPayload::Unchanged);
        }

        let bytes =
            serde_json::to_vec(&delta).map_err(|e| UplinkError::Serialize(e.to_string()))?;
        log::debug!(
            "delta: {} of {} fields ({} bytes)",
            delta.len(),
            snapshot.len(),
            bytes.len()
        );
        Ok(DeltaPayload::Delta(bytes))
    }

    /// Record a successful transmission of `snapshot`
    ///
    /// The tracked state is replaced by the full snapshot regardless of
    /// whether a full or a delta payload went over the wire; `full`
    /// additionally restarts the full-refresh interval.
    pub fn commit(&mut self, snapshot: &Map<String, Value>, full: bool) {
        self.last_sent = snapshot.clone();
        if full {
            self.last_full_ms = Some(self.clock.now_ms());
        }
    }

    /// The last acknowledged snapshot
    pub fn last_sent(&self) -> &Map<String, Value> {
        &self.last_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn encoder_with_clock() -> (DeltaEncoder, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let encoder = DeltaEncoder::new(clock.clone());
        (encoder, clock)
    }

    fn snapshot(temp: f64, hum: f64, ts: u64) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("temp".to_string(), json!(temp));
        map.insert("humidity".to_string(), json!(hum));
        map.insert("timestamp".to_string(), json!(ts));
        map
    }

    #[test]
    fn test_first_send_is_full() {
        let (encoder, _clock) = encoder_with_clock();
        let snap = snapshot(21.0, 40.0, 1);
        assert!(encoder.encode(&snap).unwrap().is_full());
    }

    #[test]
    fn test_delta_contains_only_changed_and_always_fields() {
        let (mut encoder, _clock) = encoder_with_clock();

        let snap1 = snapshot(21.0, 40.0, 1);
        encoder.commit(&snap1, true);

        let snap2 = snapshot(22.5, 40.0, 2);
        let payload = encoder.encode(&snap2).unwrap();
        let DeltaPayload::Delta(bytes) = payload else {
            panic!("expected delta");
        };

        let decoded: Map<String, Value> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.get("temp"), Some(&json!(22.5)));
        assert_eq!(decoded.get("timestamp"), Some(&json!(2)));
        assert!(decoded.get("humidity").is_none(), "unchanged field leaked");
    }

    #[test]
    fn test_delta_applied_to_state_reproduces_snapshot() {
        let (mut encoder, _clock) = encoder_with_clock();

        let snap1 = snapshot(21.0, 40.0, 1);
        encoder.commit(&snap1, true);

        let snap2 = snapshot(19.0, 45.0, 2);
        let DeltaPayload::Delta(bytes) = encoder.encode(&snap2).unwrap() else {
            panic!("expected delta");
        };

        let delta: Map<String, Value> = serde_json::from_slice(&bytes).unwrap();
        let mut merged = encoder.last_sent().clone();
        for (k, v) in delta {
            merged.insert(k, v);
        }
        assert_eq!(merged, snap2);
    }

    #[test]
    fn test_unchanged_when_nothing_qualifies() {
        let clock = Arc::new(ManualClock::new());
        // No always-include fields at all
        let config = DeltaConfig {
            full_interval: Duration::from_secs(60),
            always_include: vec![],
        };
        let mut encoder = DeltaEncoder::with_config(config, clock.clone());

        let snap = snapshot(21.0, 40.0, 1);
        encoder.commit(&snap, true);

        assert_eq!(encoder.encode(&snap).unwrap(), DeltaPayload::Unchanged);
    }

    #[test]
    fn test_full_refresh_after_interval() {
        let (mut encoder, clock) = encoder_with_clock();

        let snap = snapshot(21.0, 40.0, 1);
        encoder.commit(&snap, true);

        clock.advance(60_001);
        assert!(encoder.encode(&snap).unwrap().is_full());
    }

    #[test]
    fn test_failed_full_send_forces_full_again() {
        let (encoder, clock) = encoder_with_clock();

        let snap = snapshot(21.0, 40.0, 1);
        // Full emitted but never committed (send failed)
        assert!(encoder.encode(&snap).unwrap().is_full());
        clock.advance(5);
        // Still full on the next attempt
        assert!(encoder.encode(&snap).unwrap().is_full());
    }

    #[test]
    fn test_commit_replaces_state_wholesale() {
        let (mut encoder, _clock) = encoder_with_clock();

        let snap1 = snapshot(21.0, 40.0, 1);
        encoder.commit(&snap1, true);

        let snap2 = snapshot(25.0, 50.0, 2);
        encoder.commit(&snap2, false);

        assert_eq!(encoder.last_sent(), &snap2);
    }
}
