//! skybus node messaging engine.
//!
//! Nodes exchange JSON envelopes over a shared pub/sub broker: regex-routed
//! fire-and-forget broadcast plus blocking request/response correlation on
//! top of asynchronous delivery. See [`Node`] for the entry point.

pub mod channel;
pub mod config;
pub mod envelope;
pub mod logger;
pub mod node;
pub mod pending;
pub mod router;

pub use config::load_config;
pub use envelope::{Envelope, NodeId, ReplyBody, REPLY_LABEL};
pub use logger::{IpcLogger, LogRecord};
pub use node::{Node, State};
pub use router::{Delivery, RouteHandle, RouteOptions};

pub use skybus_transport::{MemoryBroker, Subscription, Transport};
pub use skybus_types::{
    Config, IpcError, IpcResult, LogLevel, NodeConfig, TransportConfig, TransportError,
};
