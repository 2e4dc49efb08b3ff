//! In-process broker backed by per-channel broadcast fan-out.
//!
//! Every channel is a `tokio::sync::broadcast` sender kept in a concurrent
//! map. All subscribers of a channel see every frame published while their
//! subscription is live, in publish order. A subscriber that falls too far
//! behind loses the oldest frames (at-least-once only for keeping-up
//! subscribers, same as a real pub/sub broker without persistence).

use crate::{Subscription, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use skybus_types::error::TransportError;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

/// Frames buffered per channel before slow subscribers start losing the tail.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// An in-process pub/sub broker.
///
/// Cloning is cheap and every clone addresses the same channel space.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    channels: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl MemoryBroker {
    /// Create a broker with the default per-channel buffer.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a broker with an explicit per-channel buffer size.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity,
        }
    }

    /// Number of live subscribers on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|entry| entry.receiver_count())
            .unwrap_or(0)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError> {
        // A publish with no live subscribers is not an error; the frame is
        // simply not retained.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        let rx = self.sender(channel).subscribe();
        let name = channel.to_string();
        let stream = BroadcastStream::new(rx)
            .filter_map(move |frame| {
                let name = name.clone();
                async move {
                    match frame {
                        Ok(bytes) => Some(bytes),
                        Err(BroadcastStreamRecvError::Lagged(n)) => {
                            warn!(channel = %name, dropped = n, "Slow subscriber lagged");
                            None
                        }
                    }
                }
            })
            .boxed();
        Ok(Subscription::new(channel, stream))
    }
}
