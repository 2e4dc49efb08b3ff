//! Wire envelope and codec.
//!
//! Every frame on the bus is one JSON-encoded [`Envelope`]. The payload is an
//! arbitrary JSON value; anything the sender cannot serialize fails at send
//! time, and anything a receiver cannot decode is logged and dropped.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skybus_types::error::IpcError;
use uuid::Uuid;

/// Reserved label for reply envelopes. Replies are matched to pending
/// requests by correlation id and never flow through the router.
pub const REPLY_LABEL: &str = "@reply";

/// Opaque identity of a node instance. Immutable for the node's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an explicit identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random identity.
    pub fn random() -> Self {
        Self(format!("ipc-node-{}", Uuid::new_v4()))
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Topic/purpose of the message, matched against route patterns.
    pub label: String,
    /// Arbitrary JSON payload.
    pub data: Value,
    /// Identity of the sending node.
    pub sender: NodeId,
    /// When the sender created the envelope, milliseconds since epoch.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Pairs a blocking request with its reply. Absent on broadcasts.
    pub correlation_id: Option<String>,
    /// When set, the sender also receives its own message.
    #[serde(default)]
    pub loopback: bool,
}

impl Envelope {
    /// Build a broadcast envelope stamped with the current time.
    pub fn new(label: impl Into<String>, data: Value, sender: NodeId) -> Self {
        Self {
            label: label.into(),
            data,
            sender,
            timestamp: Utc::now(),
            correlation_id: None,
            loopback: false,
        }
    }

    /// Attach a correlation id, turning this into a blocking request.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Build a reply envelope for a given correlation id.
    pub fn reply(sender: NodeId, correlation_id: String, body: &ReplyBody) -> Result<Self, IpcError> {
        let data = serde_json::to_value(body)?;
        Ok(Self::new(REPLY_LABEL, data, sender).with_correlation(correlation_id))
    }

    /// Whether this envelope is a reply to a blocking request.
    pub fn is_reply(&self) -> bool {
        self.label == REPLY_LABEL
    }
}

/// The payload of a reply envelope: the handler's return value, or the
/// failure it reported (forwarded to the blocking caller).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ReplyBody {
    /// The handler's return value (`null` when it returned nothing).
    Ok(Value),
    /// The handler failed with this message.
    Err(String),
}

/// Serialize an envelope to its wire form.
pub fn encode(envelope: &Envelope) -> Result<Bytes, IpcError> {
    Ok(Bytes::from(serde_json::to_vec(envelope)?))
}

/// Parse a wire frame into an envelope.
pub fn decode(frame: &[u8]) -> Result<Envelope, IpcError> {
    Ok(serde_json::from_slice(frame)?)
}

/// Short single-line rendering of a payload for delivery logs.
pub fn preview(value: &Value, max: usize) -> String {
    let text = value.to_string();
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = text[..end].to_string();
    out.push('…');
    out
}
