//! Configuration structs for nodes and transport adapters.
//!
//! Everything here is explicit: a node receives its configuration at
//! construction and there are no process-wide singletons inside the core.
//! Defaults only belong at the composition root.

use crate::log::LogLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration file shape (`skybus.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node-level settings.
    pub node: NodeConfig,
    /// Broker endpoint settings, consumed by transport adapters.
    pub transport: TransportConfig,
}

/// Per-node settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Fixed node identity. When absent a random identity is generated.
    pub name: Option<String>,
    /// Minimum level a log record must have to be emitted at all.
    pub log_level: LogLevel,
    /// Mirror emitted log records to the local `tracing` subscriber.
    pub log_mirror: bool,
    /// Also subscribe this node to the shared log channel, so log records
    /// from other nodes flow through its router like ordinary messages.
    pub subscribe_logs: bool,
    /// How long `stop()` waits for the dispatch task before aborting it.
    pub shutdown_timeout_ms: u64,
}

impl NodeConfig {
    /// The shutdown budget as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            log_level: LogLevel::Info,
            log_mirror: true,
            subscribe_logs: false,
            shutdown_timeout_ms: 5_000,
        }
    }
}

/// Broker endpoint settings for transport adapters that dial a real broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Broker hostname. Container deployments typically use the service name.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Broker database/namespace index.
    pub db: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "redis-ipc".to_string(),
            port: 6379,
            db: 0,
        }
    }
}
