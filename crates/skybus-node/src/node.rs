//! The IPC node: identity, lifecycle, dispatch loop, and blocking calls.
//!
//! A [`Node`] owns one identity and one route table for its whole life, and
//! one listening session per start/stop cycle. The session is a single
//! spawned dispatch task consuming the node's merged subscriptions; all other
//! operations (`send`, `send_blocking`, `register`) may be called
//! concurrently from any context.

use crate::channel::{node_channel, BROADCAST_CHANNEL, LOG_CHANNEL};
use crate::envelope::{self, Envelope, NodeId, ReplyBody};
use crate::logger::IpcLogger;
use crate::pending::PendingRequests;
use crate::router::{Delivery, Route, RouteHandle, RouteOptions, Router};
use serde::Serialize;
use serde_json::{json, Value};
use skybus_transport::{Subscription, Transport};
use skybus_types::config::NodeConfig;
use skybus_types::error::{IpcError, IpcResult};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, warn};
use uuid::Uuid;

/// Longest payload rendering embedded in delivery log records.
const PAYLOAD_PREVIEW_LEN: usize = 120;

/// Lifecycle state of a node. Transitions are monotonic within one session:
/// starting → started → stopping → stopped, with restart beginning a fresh
/// session that reuses the identity and route table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// `start()` is establishing subscriptions.
    Starting,
    /// The node can send and receive.
    Started,
    /// `stop()` is tearing the session down.
    Stopping,
    /// Not running. The initial state.
    Stopped,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            State::Starting => "starting",
            State::Started => "started",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
        })
    }
}

/// One listening session: the dispatch task and its shutdown signal.
struct Session {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// An addressable participant in the messaging layer.
///
/// Cloning is cheap; clones share the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    id: NodeId,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    router: Router,
    pending: PendingRequests,
    logger: IpcLogger,
    state: RwLock<State>,
    session: Mutex<Option<Session>>,
}

impl Node {
    /// Create a stopped node. The identity comes from the configuration, or
    /// is generated when none is configured.
    pub fn new(config: NodeConfig, transport: Arc<dyn Transport>) -> Self {
        let id = match &config.name {
            Some(name) => NodeId::new(name.clone()),
            None => NodeId::random(),
        };
        let logger = IpcLogger::new(id.clone(), Arc::clone(&transport), &config);
        Self {
            inner: Arc::new(NodeInner {
                id,
                config,
                transport,
                router: Router::new(),
                pending: PendingRequests::new(),
                logger,
                state: RwLock::new(State::Stopped),
                session: Mutex::new(None),
            }),
        }
    }

    /// This node's identity.
    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        *self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// The node's IPC logger.
    pub fn logger(&self) -> &IpcLogger {
        &self.inner.logger
    }

    /// Register a route. Allowed in any state; routes registered while the
    /// dispatch loop is running apply from the next envelope.
    pub fn register<F>(&self, pattern: &str, options: RouteOptions, handler: F) -> IpcResult<RouteHandle>
    where
        F: Fn(Delivery) -> Result<Option<Value>, String> + Send + Sync + 'static,
    {
        self.inner.router.register(pattern, options, handler)
    }

    /// Start listening: subscribe, spawn the dispatch task, become started.
    ///
    /// Fails with a transport error and stays stopped when a subscription
    /// cannot be established.
    pub async fn start(&self) -> IpcResult<()> {
        self.inner.transition(State::Stopped, State::Starting, "start")?;
        self.inner.publish_status(State::Starting).await;

        let mut channels = vec![node_channel(&self.inner.id), BROADCAST_CHANNEL.to_string()];
        if self.inner.config.subscribe_logs {
            channels.push(LOG_CHANNEL.to_string());
        }
        let mut streams = StreamMap::new();
        for channel in channels {
            match self.inner.transport.subscribe(&channel).await {
                Ok(subscription) => {
                    streams.insert(channel, subscription);
                }
                Err(e) => {
                    // Observers saw `starting`; close the arc so nobody
                    // waits on a node that never came up.
                    self.inner.set_state(State::Stopped);
                    self.inner.publish_status(State::Stopped).await;
                    return Err(e.into());
                }
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.dispatch_loop(streams, shutdown_rx).await });
        {
            let mut session = self.inner.session.lock().unwrap_or_else(|e| e.into_inner());
            *session = Some(Session {
                shutdown: shutdown_tx,
                task,
            });
        }

        self.inner.set_state(State::Started);
        self.inner.publish_status(State::Started).await;
        self.inner
            .logger
            .debug(format!("node listening on {}", self.inner.id));
        Ok(())
    }

    /// Stop listening and release the session. A no-op on a node that is
    /// already stopped or whose teardown another `stop()` owns.
    ///
    /// Returns once the dispatch task has terminated, or after the shutdown
    /// budget has elapsed and the task was aborted. Blocking calls already in
    /// flight from other contexts are not cancelled; they time out naturally.
    pub async fn stop(&self) -> IpcResult<()> {
        {
            let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
            match *state {
                State::Stopped => return Ok(()),
                // Another stop() already owns the teardown.
                State::Stopping => return Ok(()),
                State::Started => *state = State::Stopping,
                current => {
                    return Err(IpcError::InvalidState {
                        current: current.to_string(),
                        operation: "stop".to_string(),
                    })
                }
            }
        }
        self.inner.publish_status(State::Stopping).await;

        let session = self
            .inner
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(session) = session {
            let _ = session.shutdown.send(true);
            let abort = session.task.abort_handle();
            if tokio::time::timeout(self.inner.config.shutdown_timeout(), session.task)
                .await
                .is_err()
            {
                warn!(node = %self.inner.id, "Dispatch task missed the shutdown budget, aborting");
                abort.abort();
            }
        }

        self.inner.set_state(State::Stopped);
        self.inner.publish_status(State::Stopped).await;
        self.inner
            .logger
            .debug(format!("node {} stopped listening", self.inner.id));
        Ok(())
    }

    /// Broadcast a fire-and-forget message. The sending node does not
    /// receive its own message.
    pub async fn send<T: Serialize + ?Sized>(&self, label: &str, data: &T) -> IpcResult<()> {
        self.publish_broadcast(label, data, false).await
    }

    /// Broadcast a message the sending node also receives.
    pub async fn send_loopback<T: Serialize + ?Sized>(
        &self,
        label: &str,
        data: &T,
    ) -> IpcResult<()> {
        self.publish_broadcast(label, data, true).await
    }

    /// Send a blocking request to a peer and wait for its correlated reply.
    ///
    /// Fails immediately — before any network effect — when the target is
    /// this node itself. The dispatch task could in principle service such a
    /// call here, but the rejection is part of the layer's contract: a
    /// self-addressed blocking call is a design error, not a supported path.
    pub async fn send_blocking<T: Serialize + ?Sized>(
        &self,
        target: &NodeId,
        label: &str,
        data: &T,
        timeout: Duration,
    ) -> IpcResult<Value> {
        self.inner.ensure_started("send_blocking")?;
        if *target == self.inner.id {
            return Err(IpcError::InvalidArgument("blocking call to self".to_string()));
        }
        let value = serde_json::to_value(data)?;
        let correlation_id = Uuid::new_v4().to_string();
        let frame = envelope::encode(
            &Envelope::new(label, value, self.inner.id.clone())
                .with_correlation(correlation_id.clone()),
        )?;

        // Register before publishing so a fast responder cannot beat the
        // wait; a failed publish removes the registration again and the
        // caller never suspends.
        let rx = self.inner.pending.register(&correlation_id);
        if let Err(e) = self
            .inner
            .transport
            .publish(&node_channel(target), frame)
            .await
        {
            self.inner.pending.remove(&correlation_id);
            return Err(e.into());
        }
        self.inner
            .logger
            .debug(format!("sent blocking '{label}' to {target}"));

        let started = Instant::now();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ReplyBody::Ok(value))) => Ok(value),
            Ok(Ok(ReplyBody::Err(message))) => Err(IpcError::Handler {
                label: label.to_string(),
                message,
            }),
            // The entry was dropped without a reply; surfaces as an expired
            // wait, matching unclean-shutdown semantics.
            Ok(Err(_)) => Err(IpcError::Timeout {
                label: label.to_string(),
                elapsed: started.elapsed(),
            }),
            Err(_) => {
                self.inner.pending.remove(&correlation_id);
                Err(IpcError::Timeout {
                    label: label.to_string(),
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    async fn publish_broadcast<T: Serialize + ?Sized>(
        &self,
        label: &str,
        data: &T,
        loopback: bool,
    ) -> IpcResult<()> {
        self.inner.ensure_started("send")?;
        let value = serde_json::to_value(data)?;
        let mut env = Envelope::new(label, value, self.inner.id.clone());
        env.loopback = loopback;
        let frame = envelope::encode(&env)?;
        self.inner.transport.publish(BROADCAST_CHANNEL, frame).await?;
        self.inner.logger.debug(format!("sent '{label}'"));
        Ok(())
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl NodeInner {
    fn ensure_started(&self, operation: &str) -> IpcResult<()> {
        let current = *self.state.read().unwrap_or_else(|e| e.into_inner());
        if current != State::Started {
            return Err(IpcError::InvalidState {
                current: current.to_string(),
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    fn transition(&self, from: State, to: State, operation: &str) -> IpcResult<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state != from {
            return Err(IpcError::InvalidState {
                current: state.to_string(),
                operation: operation.to_string(),
            });
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: State) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = to;
    }

    /// Best-effort lifecycle status broadcast, `status.<node>.<state>`.
    async fn publish_status(&self, state: State) {
        let env = Envelope::new(
            format!("status.{}.{state}", self.id),
            json!({ "node": self.id, "state": state.to_string() }),
            self.id.clone(),
        );
        let Ok(frame) = envelope::encode(&env) else {
            return;
        };
        if let Err(e) = self.transport.publish(BROADCAST_CHANNEL, frame).await {
            debug!(node = %self.id, error = %e, "Status publish failed");
        }
    }

    /// The per-session consumer: pulls frames from the merged subscriptions
    /// until stopped or the transport ends the streams.
    async fn dispatch_loop(
        self: Arc<Self>,
        mut streams: StreamMap<String, Subscription>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(node = %self.id, "Dispatch loop running");
        loop {
            tokio::select! {
                // Any change (or a dropped sender) means shutdown.
                _ = shutdown.changed() => break,
                frame = streams.next() => match frame {
                    Some((channel, frame)) => self.handle_frame(&channel, frame).await,
                    None => break,
                },
            }
        }
        debug!(node = %self.id, "Dispatch loop terminated");
    }

    async fn handle_frame(self: &Arc<Self>, channel: &str, frame: bytes::Bytes) {
        let env = match envelope::decode(&frame) {
            Ok(env) => env,
            Err(e) => {
                self.logger
                    .error(format!("dropping malformed frame on '{channel}': {e}"));
                return;
            }
        };

        if env.is_reply() {
            let Some(correlation_id) = env.correlation_id else {
                self.logger
                    .error(format!("dropping reply without correlation id from {}", env.sender));
                return;
            };
            let body = match serde_json::from_value::<ReplyBody>(env.data) {
                Ok(body) => body,
                Err(e) => {
                    self.logger
                        .error(format!("dropping malformed reply from {}: {e}", env.sender));
                    return;
                }
            };
            if !self.pending.resolve(&correlation_id, body) {
                self.logger.debug(format!(
                    "discarding late reply '{correlation_id}' from {}",
                    env.sender
                ));
            }
            return;
        }

        if env.sender == self.id && !env.loopback {
            return;
        }
        self.route_envelope(env).await;
    }

    /// Invoke every matching route in registration order. Handler failures
    /// are isolated per route and never reach the loop.
    async fn route_envelope(self: &Arc<Self>, env: Envelope) {
        let routes = self.router.matching(&env.label);
        for route in routes {
            if !route.options.suppress_log {
                self.logger.debug(format!(
                    "received '{}' from {}: {}",
                    env.label,
                    env.sender,
                    envelope::preview(&env.data, PAYLOAD_PREVIEW_LEN)
                ));
            }
            let delivery = Delivery {
                label: env.label.clone(),
                sender: env.sender.clone(),
                data: env.data.clone(),
            };
            if route.options.concurrent {
                let inner = Arc::clone(self);
                let route = Arc::clone(&route);
                let label = env.label.clone();
                let sender = env.sender.clone();
                let correlation_id = env.correlation_id.clone();
                tokio::spawn(async move {
                    let handler = Arc::clone(&route.handler);
                    let result = match tokio::task::spawn_blocking(move || handler(delivery)).await
                    {
                        Ok(result) => result,
                        Err(e) => Err(format!("handler panicked: {e}")),
                    };
                    inner
                        .finish_route(&route, &label, &sender, correlation_id, result)
                        .await;
                });
            } else {
                // A panicking handler must not unwind into the dispatch
                // task; it is downgraded to a failed delivery like any
                // other handler error.
                let handler = Arc::clone(&route.handler);
                let result =
                    std::panic::catch_unwind(AssertUnwindSafe(move || handler(delivery)))
                        .unwrap_or_else(|_| Err("handler panicked".to_string()));
                self.finish_route(
                    &route,
                    &env.label,
                    &env.sender,
                    env.correlation_id.clone(),
                    result,
                )
                .await;
            }
        }
    }

    async fn finish_route(
        &self,
        route: &Route,
        label: &str,
        sender: &NodeId,
        correlation_id: Option<String>,
        result: Result<Option<Value>, String>,
    ) {
        match result {
            Ok(value) => {
                if route.options.block {
                    match correlation_id {
                        Some(correlation_id) => {
                            let body = ReplyBody::Ok(value.unwrap_or(Value::Null));
                            self.send_reply(sender, correlation_id, body, route.options.timeout)
                                .await;
                        }
                        None => self.logger.debug(format!(
                            "blocking route '{}' received uncorrelated '{label}', no reply sent",
                            route.pattern
                        )),
                    }
                }
            }
            Err(message) => {
                self.logger.error(format!(
                    "handler '{}' failed for '{label}' from {sender}: {message}",
                    route.pattern
                ));
                if route.options.block {
                    if let Some(correlation_id) = correlation_id {
                        self.send_reply(
                            sender,
                            correlation_id,
                            ReplyBody::Err(message),
                            route.options.timeout,
                        )
                        .await;
                    }
                }
            }
        }
    }

    /// Publish a reply to the requester's direct channel within the route's
    /// reply budget.
    async fn send_reply(&self, to: &NodeId, correlation_id: String, body: ReplyBody, budget: Duration) {
        let frame = match Envelope::reply(self.id.clone(), correlation_id, &body)
            .and_then(|reply| envelope::encode(&reply))
        {
            Ok(frame) => frame,
            Err(e) => {
                self.logger.error(format!("failed to encode reply for {to}: {e}"));
                return;
            }
        };
        match tokio::time::timeout(budget, self.transport.publish(&node_channel(to), frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self
                .logger
                .error(format!("failed to publish reply to {to}: {e}")),
            Err(_) => self.logger.error(format!("reply publish to {to} timed out")),
        }
    }
}
