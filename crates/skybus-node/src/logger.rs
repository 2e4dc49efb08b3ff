//! IPC logger: structured log records published as ordinary envelopes.
//!
//! Log records travel on the well-known log channel so any node can observe
//! them, labeled `log.<LEVEL>.<node>` for regex routing. Emission never
//! blocks on delivery and never fails the caller; a failed publish surfaces,
//! at most, on the local mirror.

use crate::channel::LOG_CHANNEL;
use crate::envelope::{self, Envelope, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skybus_types::config::NodeConfig;
use skybus_types::log::LogLevel;
use skybus_transport::Transport;
use std::sync::Arc;

/// The payload of a log envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Which node emitted the record.
    pub node: NodeId,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// When it was emitted, milliseconds since epoch.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Per-node logger handle. Cheap to clone.
#[derive(Clone)]
pub struct IpcLogger {
    node: NodeId,
    transport: Arc<dyn Transport>,
    level: LogLevel,
    mirror: bool,
}

impl IpcLogger {
    /// Build a logger for one node from its configuration.
    pub fn new(node: NodeId, transport: Arc<dyn Transport>, config: &NodeConfig) -> Self {
        Self {
            node,
            transport,
            level: config.log_level,
            mirror: config.log_mirror,
        }
    }

    /// Emit a log record. Records below the configured level are dropped.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        if level < self.level {
            return;
        }
        let record = LogRecord {
            node: self.node.clone(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
        };
        if self.mirror {
            mirror_record(&record);
        }
        let Ok(data) = serde_json::to_value(&record) else {
            return;
        };
        let mut env = Envelope::new(
            format!("log.{}.{}", record.level, record.node),
            data,
            self.node.clone(),
        );
        env.loopback = true;
        let Ok(frame) = envelope::encode(&env) else {
            return;
        };
        // Fire and forget. Outside a runtime only the mirror is available.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let transport = Arc::clone(&self.transport);
            handle.spawn(async move {
                if let Err(e) = transport.publish(LOG_CHANNEL, frame).await {
                    tracing::debug!(error = %e, "Log publish failed");
                }
            });
        }
    }

    /// Emit at DEBUG.
    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    /// Emit at INFO.
    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    /// Emit at WARNING.
    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    /// Emit at ERROR.
    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Emit at CRITICAL.
    pub fn critical(&self, message: impl Into<String>) {
        self.log(LogLevel::Critical, message);
    }
}

impl std::fmt::Debug for IpcLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcLogger")
            .field("node", &self.node)
            .field("level", &self.level)
            .field("mirror", &self.mirror)
            .finish_non_exhaustive()
    }
}

/// Mirror a record to the local tracing subscriber.
fn mirror_record(record: &LogRecord) {
    match record.level {
        LogLevel::Debug => tracing::debug!(node = %record.node, "{}", record.message),
        LogLevel::Info => tracing::info!(node = %record.node, "{}", record.message),
        LogLevel::Warning => tracing::warn!(node = %record.node, "{}", record.message),
        LogLevel::Error => tracing::error!(node = %record.node, "{}", record.message),
        LogLevel::Critical => {
            tracing::error!(node = %record.node, critical = true, "{}", record.message)
        }
    }
}
