//! # Uplink
//!
//! A resilient telemetry uplink for devices on constrained, intermittent
//! links. Readings flow through an adaptive change-threshold sampler
//! into a size/time/count-bounded batcher; flushed batches are delta
//! encoded against the last delivered snapshot, queued with priority
//! semantics, and pushed over a manually driven TLS + HTTP/1.0 exchange.
//! Failed deliveries back off exponentially and, once retries are
//! exhausted, spill into an append-only overflow store that is drained
//! in bounded chunks when connectivity returns.
//!
//! ## Example
//!
//! ```no_run
//! use uplink::{AgentConfig, HttpsUplink, UplinkAgent};
//!
//! fn main() -> uplink::Result<()> {
//!     let config = AgentConfig::new("https://sensors.example.com/api/v1/AddList", "device-7", "secret")?;
//!     let uplink = HttpsUplink::new(
//!         config.endpoint.clone(),
//!         config.credentials.clone(),
//!         config.transport.clone(),
//!     );
//!     let mut agent = UplinkAgent::new(config, uplink);
//!
//!     agent.register_metric_with_threshold("temperature", 0.5);
//!     loop {
//!         agent.offer_reading("temperature", read_temperature());
//!         agent.tick()?;
//!         if agent.status().link_up && agent.overflow_pending() {
//!             agent.drain_overflow()?;
//!         }
//!         std::thread::sleep(std::time::Duration::from_millis(250));
//!     }
//! }
//! # fn read_temperature() -> f64 { 21.5 }
//! ```

pub mod agent;
pub mod batcher;
pub mod clock;
pub mod config;
pub mod delta;
pub mod error;
pub mod monitor;
pub mod queue;
pub mod retry;
pub mod sampler;
pub mod store;
pub mod transport;

pub use agent::{ConnectionStatus, UplinkAgent};
pub use batcher::{BatchConfig, SmartBatcher};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{AgentConfig, Credentials, Endpoint};
pub use delta::{DeltaConfig, DeltaEncoder, DeltaPayload};
pub use error::{Result, StoreError, TransportError, UplinkError};
pub use monitor::{MonitorConfig, NetworkMonitor, NetworkStats};
pub use queue::{PopOutcome, Priority, PriorityQueue, PushOutcome, QueueEntry};
pub use retry::{RetryConfig, RetryManager};
pub use sampler::{AdaptiveSampler, SamplerConfig, SensorReading, MAX_TRACKED_METRICS};
pub use store::{DrainReport, OverflowStore, StoreConfig};
pub use transport::{
    ExchangeReport, HandshakeStep, HttpsUplink, IoStep, Phase, SecureSession, TlsLink,
    TransportConfig, Uplink,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_matches_manifest() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
