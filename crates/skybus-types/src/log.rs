//! Log levels shared between node configuration and the wire log records.

use serde::{Deserialize, Serialize};

/// Severity of an IPC log record.
///
/// Ordered so that per-node filtering is a simple `>=` comparison.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Diagnostic detail, filtered out by default.
    Debug,
    /// Normal operational messages.
    #[default]
    Info,
    /// Something unexpected but recoverable.
    Warning,
    /// An operation failed.
    Error,
    /// The node cannot continue doing useful work.
    Critical,
}

impl LogLevel {
    /// The uppercase wire form of the level, as embedded in log labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
