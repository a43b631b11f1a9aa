//! Agent-level configuration
//!
//! Per-component tuning knobs live next to the component they configure
//! ([`SamplerConfig`](crate::sampler::SamplerConfig),
//! [`BatchConfig`](crate::batcher::BatchConfig), ...); this module holds
//! the endpoint, the credentials, and the aggregate [`AgentConfig`].

use crate::batcher::BatchConfig;
use crate::delta::DeltaConfig;
use crate::error::UplinkError;
use crate::monitor::MonitorConfig;
use crate::retry::RetryConfig;
use crate::sampler::SamplerConfig;
use crate::store::StoreConfig;
use crate::transport::TransportConfig;
use std::time::Duration;

/// Parsed upload endpoint (host, port, request path)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Server hostname
    pub host: String,
    /// TCP port (443 unless the URL says otherwise)
    pub port: u16,
    /// Request path, always starting with '/'
    pub path: String,
}

impl Endpoint {
    /// Parse an endpoint from a URL string
    ///
    /// Accepts `https://host/path`, `host/path` or a bare host. A bare
    /// host gets path "/". An empty host is a configuration error.
    pub fn parse(url: &str) -> Result<Self, UplinkError> {
        let rest = match url.find("://") {
            Some(idx) => &url[idx + 3..],
            None => url,
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, "/".to_string()),
        };

        let (host, port) = match authority.rfind(':') {
            Some(idx) => {
                let port = authority[idx + 1..].parse::<u16>().map_err(|_| {
                    UplinkError::Config(format!("invalid port in URL: {}", url))
                })?;
                (authority[..idx].to_string(), port)
            }
            None => {
                let port = if url.starts_with("http://") { 80 } else { 443 };
                (authority.to_string(), port)
            }
        };

        if host.is_empty() {
            return Err(UplinkError::Config(format!("empty host in URL: {}", url)));
        }

        Ok(Self { host, port, path })
    }
}

/// HTTP Basic credentials for the upload endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl Credentials {
    /// Create credentials
    ///
    /// An empty username is a configuration error: the server rejects
    /// anonymous pushes, so failing here avoids a guaranteed-dead retry
    /// cycle.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, UplinkError> {
        let username = username.into();
        if username.is_empty() {
            return Err(UplinkError::Config("empty username".to_string()));
        }
        Ok(Self {
            username,
            password: password.into(),
        })
    }
}

/// Full configuration surface of the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Upload endpoint
    pub endpoint: Endpoint,
    /// Basic-auth credentials
    pub credentials: Credentials,
    /// Adaptive sampler tuning
    pub sampler: SamplerConfig,
    /// Batcher flush triggers
    pub batch: BatchConfig,
    /// Delta encoder tuning
    pub delta: DeltaConfig,
    /// In-memory queue capacity
    pub queue_capacity: usize,
    /// Backoff policy for failed deliveries
    pub retry: RetryConfig,
    /// Transport deadlines and chunking
    pub transport: TransportConfig,
    /// Overflow store location and chunking
    pub store: StoreConfig,
    /// Metrics reporting interval
    pub monitor: MonitorConfig,
    /// Minimum spacing between transport attempts
    pub min_send_interval: Duration,
}

impl AgentConfig {
    /// Build a configuration for the given URL and credentials, with
    /// every other knob at its default
    pub fn new(
        url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, UplinkError> {
        Ok(Self {
            endpoint: Endpoint::parse(url)?,
            credentials: Credentials::new(username, password)?,
            sampler: SamplerConfig::default(),
            batch: BatchConfig::default(),
            delta: DeltaConfig::default(),
            queue_capacity: 100,
            retry: RetryConfig::default(),
            transport: TransportConfig::default(),
            store: StoreConfig::default(),
            monitor: MonitorConfig::default(),
            min_send_interval: Duration::from_secs(1),
        })
    }
}
