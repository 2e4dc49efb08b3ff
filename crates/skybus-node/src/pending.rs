//! Pending blocking requests, keyed by correlation id.
//!
//! Each entry is a one-shot completion slot: the dispatch loop resolves it at
//! most once, and after removal (resolution, timeout, or send failure) no new
//! wait can observe it. Late replies simply find no entry.

use crate::envelope::ReplyBody;
use dashmap::DashMap;
use tokio::sync::oneshot;

/// The pending-request map shared between callers and the dispatch loop.
pub struct PendingRequests {
    inner: DashMap<String, oneshot::Sender<ReplyBody>>,
}

impl PendingRequests {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Register a request and get the receiver its reply will arrive on.
    pub fn register(&self, correlation_id: &str) -> oneshot::Receiver<ReplyBody> {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(correlation_id.to_string(), tx);
        rx
    }

    /// Resolve a request with a reply body. Returns false when no request
    /// with this correlation id is outstanding (late or duplicate reply).
    pub fn resolve(&self, correlation_id: &str, body: ReplyBody) -> bool {
        match self.inner.remove(correlation_id) {
            Some((_, tx)) => {
                // The waiter may already have given up; that is its problem.
                let _ = tx.send(body);
                true
            }
            None => false,
        }
    }

    /// Drop a request without resolving it (timeout or publish failure).
    pub fn remove(&self, correlation_id: &str) -> bool {
        self.inner.remove(correlation_id).is_some()
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no requests are outstanding.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
