//! Configuration types for the build engine.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Build engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of concurrent module builds within one group.
    pub parallelism: usize,
    /// How long the engine stays quiet before declaring itself idle.
    #[serde(with = "serde_duration_millis")]
    pub idle_debounce: Duration,
    /// Language plugin timing.
    pub plugin: PluginConfig,
    /// File watcher timing.
    pub watch: WatchConfig,
    /// Deployment timing.
    pub deploy: DeployConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            idle_debounce: Duration::from_secs(2),
            plugin: PluginConfig::default(),
            watch: WatchConfig::default(),
            deploy: DeployConfig::default(),
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(4)
}

/// Language plugin timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// How long a plugin has to answer its first ping after launch.
    #[serde(with = "serde_duration_secs")]
    pub start_timeout: Duration,
    /// Grace between SIGINT and SIGKILL on shutdown.
    #[serde(with = "serde_duration_secs")]
    pub kill_timeout: Duration,
    /// Extra environment passed to every plugin process.
    pub env: HashMap<String, String>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(30),
            kill_timeout: Duration::from_secs(10),
            env: HashMap::new(),
        }
    }
}

/// File watcher timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Poll interval between filesystem scans.
    #[serde(with = "serde_duration_millis")]
    pub period: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(500),
        }
    }
}

/// Deployment timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Status poll interval while waiting for replicas to come up.
    #[serde(with = "serde_duration_millis")]
    pub poll_interval: Duration,
    /// How long to wait for replicas before giving up.
    #[serde(with = "serde_duration_secs")]
    pub wait_timeout: Duration,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            wait_timeout: Duration::from_secs(60),
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
