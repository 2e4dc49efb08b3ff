//! Transport boundary for skybus.
//!
//! A transport is any broker client that offers named channels with
//! `publish` and `subscribe`, at-least-once delivery to active subscribers,
//! and per-channel publish ordering. The node core only ever talks to the
//! [`Transport`] trait; the bundled [`MemoryBroker`] serves tests and
//! single-process deployments, while real broker clients (a Redis client,
//! typically) implement the trait out of tree using
//! [`skybus_types::TransportConfig`] for the endpoint.

pub mod memory;

pub use memory::MemoryBroker;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use skybus_types::error::TransportError;
use std::pin::Pin;
use std::task::{Context, Poll};

/// An active subscription: an ordered stream of raw frames for one channel.
///
/// Dropping the subscription unsubscribes. The transport makes no delivery
/// promise for messages published while no subscription is active.
pub struct Subscription {
    channel: String,
    stream: BoxStream<'static, Bytes>,
}

impl Subscription {
    /// Build a subscription from a channel name and a frame stream.
    pub fn new(channel: impl Into<String>, stream: BoxStream<'static, Bytes>) -> Self {
        Self {
            channel: channel.into(),
            stream,
        }
    }

    /// The channel this subscription listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl futures::Stream for Subscription {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.stream.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// A pub/sub broker client.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publish one frame on a channel. Returns once the broker accepted it.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Open a subscription on a channel.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError>;
}
