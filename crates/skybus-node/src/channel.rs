//! Channel naming scheme.
//!
//! Names are deterministic and collision-free across nodes sharing one
//! broker: every node listens on its own direct channel (for blocking
//! requests and replies addressed to it) plus the shared broadcast channel.

use crate::envelope::NodeId;

/// Shared channel every node subscribes to for fire-and-forget messages.
pub const BROADCAST_CHANNEL: &str = "skybus:broadcast";

/// Well-known channel carrying structured log envelopes from all nodes.
pub const LOG_CHANNEL: &str = "skybus:log";

/// The direct channel of a node, derived from its identity.
pub fn node_channel(id: &NodeId) -> String {
    format!("skybus:node:{id}")
}
