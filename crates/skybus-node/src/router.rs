//! Route table: regex patterns over labels bound to handlers.
//!
//! Routes are immutable once registered and evaluated in registration order.
//! The table is shared between caller contexts (`register`) and the dispatch
//! loop; dispatch snapshots the matching routes under a read lock, so a
//! concurrent registration never corrupts an in-flight dispatch and only
//! affects future envelopes.

use crate::envelope::NodeId;
use regex_lite::Regex;
use serde_json::Value;
use skybus_types::error::{IpcError, IpcResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// What a handler receives: the envelope's payload and sender identity.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The concrete label the envelope was sent with.
    pub label: String,
    /// Who sent it.
    pub sender: NodeId,
    /// The payload.
    pub data: Value,
}

/// A route handler. Returning `Err` marks the delivery as failed; the error
/// is logged (and forwarded to the caller on blocking routes) without
/// affecting sibling handlers or the dispatch loop.
pub type Handler = Arc<dyn Fn(Delivery) -> Result<Option<Value>, String> + Send + Sync>;

/// Options attached to a route at registration.
#[derive(Debug, Clone)]
pub struct RouteOptions {
    /// Send the handler's return value back to the sender as a reply.
    pub block: bool,
    /// Budget for publishing the reply of a blocking route.
    pub timeout: Duration,
    /// Skip the per-delivery log record.
    pub suppress_log: bool,
    /// Run the handler on a blocking worker so it cannot stall dispatch.
    pub concurrent: bool,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            block: false,
            timeout: Duration::from_secs(5),
            suppress_log: false,
            concurrent: false,
        }
    }
}

impl RouteOptions {
    /// Options for a request/response route.
    pub fn blocking() -> Self {
        Self {
            block: true,
            ..Self::default()
        }
    }
}

/// Handle returned by `register`, identifying one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteHandle(u64);

/// One registered route.
pub struct Route {
    /// The handle this route was registered under.
    pub handle: RouteHandle,
    /// The pattern as the caller wrote it.
    pub pattern: String,
    /// Anchored compiled form; matches the full label, never a prefix.
    regex: Regex,
    /// The handler to invoke on a match.
    pub handler: Handler,
    /// Registration options.
    pub options: RouteOptions,
}

impl Route {
    /// Whether this route matches a label in full.
    pub fn matches(&self, label: &str) -> bool {
        self.regex.is_match(label)
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("handle", &self.handle)
            .field("pattern", &self.pattern)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// The ordered route table of one node.
pub struct Router {
    routes: RwLock<Vec<Arc<Route>>>,
    next_handle: AtomicU64,
}

impl Router {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            next_handle: AtomicU64::new(0),
        }
    }

    /// Append a route. The pattern is a regex evaluated against the full
    /// label string; an invalid pattern is rejected before registration.
    pub fn register<F>(&self, pattern: &str, options: RouteOptions, handler: F) -> IpcResult<RouteHandle>
    where
        F: Fn(Delivery) -> Result<Option<Value>, String> + Send + Sync + 'static,
    {
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
            IpcError::InvalidArgument(format!("invalid route pattern '{pattern}': {e}"))
        })?;
        let handle = RouteHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let route = Arc::new(Route {
            handle,
            pattern: pattern.to_string(),
            regex,
            handler: Arc::new(handler),
            options,
        });
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.push(route);
        Ok(handle)
    }

    /// Snapshot of all routes matching a label, in registration order.
    pub fn matching(&self, label: &str) -> Vec<Arc<Route>> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes
            .iter()
            .filter(|route| route.matches(label))
            .cloned()
            .collect()
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
