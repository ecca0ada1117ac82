//! Configuration types for the controller.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Controller configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// HTTP API configuration.
    pub api: ApiConfig,
    /// Runner fleet timing.
    pub runners: RunnerConfig,
    /// Reconciliation and fan-out timing.
    pub scheduling: SchedulingConfig,
}

/// HTTP API configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Endpoint other cluster members reach this controller on.
    pub advertise: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8892),
            advertise: None,
        }
    }
}

/// Runner fleet timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Time without a heartbeat before a runner is reaped.
    #[serde(with = "serde_duration_secs")]
    pub heartbeat_timeout: Duration,
    /// How long a reservation may stay unconfirmed.
    #[serde(with = "serde_duration_secs")]
    pub reservation_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(10),
            reservation_timeout: Duration::from_secs(120),
        }
    }
}

/// Reconciliation and fan-out timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Reconciler tick interval.
    #[serde(with = "serde_duration_millis")]
    pub reconcile_interval: Duration,
    /// Schema fan-out diff interval.
    #[serde(with = "serde_duration_millis")]
    pub fanout_interval: Duration,
    /// Controller heartbeat timeout.
    #[serde(with = "serde_duration_secs")]
    pub controller_timeout: Duration,
    /// Artefact stream chunk size in bytes.
    pub artefact_chunk_size: usize,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_millis(1000),
            fanout_interval: Duration::from_millis(1000),
            controller_timeout: Duration::from_secs(10),
            artefact_chunk_size: 1024 * 1024,
        }
    }
}

/// Serde helper for Duration as seconds.
mod serde_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helper for Duration as milliseconds.
mod serde_duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
