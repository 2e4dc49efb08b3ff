//! Error taxonomy for the skybus IPC layer.
//!
//! Callers can distinguish a timeout from a transport failure from a decode
//! failure by variant alone; no string matching is ever required.

use std::time::Duration;
use thiserror::Error;

/// Errors from the transport boundary (the broker client).
#[derive(Error, Debug)]
pub enum TransportError {
    /// An I/O error from the underlying connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The broker connection is closed.
    #[error("Broker connection closed")]
    Closed,

    /// A publish was rejected or lost before acknowledgment.
    #[error("Publish on '{channel}' failed: {reason}")]
    Publish {
        /// The channel the publish targeted.
        channel: String,
        /// Why it failed.
        reason: String,
    },

    /// A subscription could not be established.
    #[error("Subscribe on '{channel}' failed: {reason}")]
    Subscribe {
        /// The channel the subscription targeted.
        channel: String,
        /// Why it failed.
        reason: String,
    },

    /// Any other broker-side error.
    #[error("Broker error: {0}")]
    Broker(String),
}

/// Top-level error type for node operations.
///
/// No variant here is fatal to the process; the worst case is a node that
/// keeps failing with [`IpcError::InvalidState`] until it is restarted.
#[derive(Error, Debug)]
pub enum IpcError {
    /// The broker was unreachable or a publish/subscribe failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking call exceeded its deadline.
    #[error("Blocking call '{label}' timed out after {elapsed:?}")]
    Timeout {
        /// The label of the request that timed out.
        label: String,
        /// How long the caller actually waited.
        elapsed: Duration,
    },

    /// The node is in the wrong lifecycle state for the requested operation.
    #[error("Node is in state '{current}' for operation '{operation}'")]
    InvalidState {
        /// The current state of the node.
        current: String,
        /// The operation that was attempted.
        operation: String,
    },

    /// The caller passed an argument the node rejects by construction.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A remote blocking-route handler reported a failure.
    #[error("Handler for '{label}' failed: {message}")]
    Handler {
        /// The label the failing handler was registered for.
        label: String,
        /// The failure message forwarded in the reply.
        message: String,
    },
}

/// Alias for node operation results.
pub type IpcResult<T> = Result<T, IpcError>;
