//! Shared types for the skybus IPC layer.
//!
//! This crate carries the pieces every other skybus crate needs: the error
//! taxonomy, log levels, and configuration structs. It deliberately has no
//! runtime dependencies so transport adapters can depend on it freely.

pub mod config;
pub mod error;
pub mod log;

pub use config::{Config, NodeConfig, TransportConfig};
pub use error::{IpcError, IpcResult, TransportError};
pub use log::LogLevel;
