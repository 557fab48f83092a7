//! Configuration management

use crate::latch::DEFAULT_LATCH_TIMEOUT;
use crate::tunnel::{
    ChannelOptions, DEFAULT_RECEIVE_CAPACITY, DEFAULT_SIZE_THRESHOLD, DEFAULT_TIME_THRESHOLD,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Channel buffering
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Completion latch timeouts
    #[serde(default)]
    pub latch: LatchConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Options for newly opened channels. The latch timeout bounds how long a
    /// channel may sit idle before a sweep expires its teardown latch.
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            size_threshold: self.tunnel.size_threshold,
            time_threshold: Duration::from_millis(self.tunnel.time_threshold_ms),
            receive_capacity: self.tunnel.receive_capacity,
            idle_timeout: self.latch.timeout(),
        }
    }
}

/// Channel buffering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Coalesced bytes that force an immediate flush
    pub size_threshold: usize,
    /// Longest delay of a buffered write (milliseconds)
    pub time_threshold_ms: u64,
    /// Initial inbound queue capacity
    pub receive_capacity: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            size_threshold: DEFAULT_SIZE_THRESHOLD,
            time_threshold_ms: DEFAULT_TIME_THRESHOLD.as_millis() as u64,
            receive_capacity: DEFAULT_RECEIVE_CAPACITY,
        }
    }
}

/// Completion latch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatchConfig {
    /// Idle time after which an outstanding latch is expired (milliseconds)
    pub timeout_ms: u64,
    /// Interval between expiry sweeps (milliseconds)
    pub sweep_interval_ms: u64,
}

impl Default for LatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_LATCH_TIMEOUT.as_millis() as u64,
            sweep_interval_ms: 1000,
        }
    }
}

impl LatchConfig {
    /// Latch wait timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Sweep interval
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config::default()
}
