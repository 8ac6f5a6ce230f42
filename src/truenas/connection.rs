//! WebSocket Connection Management
//!
//! This module owns the single long-lived connection to TrueNAS. One worker task per
//! session runs the lifecycle: connect, authenticate with the API key, serve calls and
//! notifications, and on any transport failure back off and start over.
//!
//! The worker is the only code that touches the transport and the request registry.
//! The session facade reaches it through a command channel; replies travel back on
//! oneshot channels.

use crate::config::{OfflineCallPolicy, SessionConfig};
use crate::error::{Result, SessionError};
use crate::truenas::backoff::ExponentialBackoff;
use crate::truenas::codec::{self, Frame};
use crate::truenas::dispatcher::SubscriptionDispatcher;
use crate::truenas::registry::{deadline_after, PendingCall, RequestRegistry};
use crate::truenas::session::CallOptions;
use crate::truenas::state::{CloseReason, ConnectionState, SharedState};
use crate::truenas::transport::{Connector, Transport};
use crate::truenas::types::RequestId;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Requests from the session facade to the worker
pub(crate) enum Command {
    Call {
        method: String,
        params: Value,
        options: CallOptions,
        reply: oneshot::Sender<Result<PendingCall>>,
    },
    /// First handler registered for a topic
    TopicAdded(String),
    /// Last handler removed from a topic
    TopicRemoved(String),
    Reconnect,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Call waiting for the connection under the queueing offline policy
struct QueuedCall {
    method: String,
    params: Value,
    options: CallOptions,
    reply: oneshot::Sender<Result<PendingCall>>,
    deadline: Instant,
}

/// Calls the worker issues on its own behalf
enum InternalCall {
    Heartbeat,
    Subscribe(String),
    Unsubscribe(String),
}

type InternalFuture = Pin<Box<dyn Future<Output = (InternalCall, Result<Value>)> + Send>>;

/// Why a wait outside the Connected state was cut short
enum Interrupt {
    Shutdown(Option<oneshot::Sender<()>>),
    Retry,
}

/// How one connection attempt ended
enum Exit {
    Shutdown(Option<oneshot::Sender<()>>),
    Lost { reason: String, immediate: bool },
    AuthRejected(String),
}

impl Exit {
    fn lost(reason: impl Into<String>) -> Self {
        Exit::Lost {
            reason: reason.into(),
            immediate: false,
        }
    }

    fn retry_now() -> Self {
        Exit::Lost {
            reason: "reconnect requested".to_string(),
            immediate: true,
        }
    }
}

enum AuthOutcome {
    Accepted,
    Rejected(String),
}

/// Manages the persistent WebSocket connection to TrueNAS
pub(crate) struct ConnectionManager {
    config: SessionConfig,
    api_key: SecretString,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    registry: RequestRegistry,
    dispatcher: Arc<SubscriptionDispatcher>,
    shared: Arc<SharedState>,
    backoff: ExponentialBackoff,
    queue: VecDeque<QueuedCall>,
    internal: FuturesUnordered<InternalFuture>,
    /// Server-side subscription ids by topic; `None` while `core.subscribe` is in flight
    remote_subscriptions: HashMap<String, Option<Value>>,
    malformed_streak: u32,
}

impl ConnectionManager {
    pub(crate) fn new(
        config: SessionConfig,
        api_key: SecretString,
        connector: Arc<dyn Connector>,
        commands: mpsc::UnboundedReceiver<Command>,
        dispatcher: Arc<SubscriptionDispatcher>,
        shared: Arc<SharedState>,
    ) -> Self {
        let backoff = ExponentialBackoff::from_config(&config);
        Self {
            config,
            api_key,
            connector,
            commands,
            registry: RequestRegistry::new(),
            dispatcher,
            shared,
            backoff,
            queue: VecDeque::new(),
            internal: FuturesUnordered::new(),
            remote_subscriptions: HashMap::new(),
            malformed_streak: 0,
        }
    }

    /// Drive the connection until shutdown or a terminal failure
    pub(crate) async fn run(mut self) {
        loop {
            match self.connect_once().await {
                Exit::Shutdown(done) => {
                    self.finish(CloseReason::Shutdown, None);
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                    return;
                }
                Exit::AuthRejected(reason) => {
                    let error = SessionError::AuthenticationFailed(reason.clone()).to_string();
                    self.finish(CloseReason::AuthenticationFailed(reason), Some(error));
                    return;
                }
                Exit::Lost { reason, immediate } => {
                    let delay = if immediate {
                        Some(Duration::ZERO)
                    } else {
                        self.backoff.next_delay()
                    };

                    let Some(delay) = delay else {
                        let reason = format!(
                            "giving up after {} reconnect attempts: {}",
                            self.backoff.attempt(),
                            reason
                        );
                        self.finish(CloseReason::RetriesExhausted(reason.clone()), Some(reason));
                        return;
                    };

                    self.enter_reconnecting(&reason, delay);

                    match self.until(sleep(delay)).await {
                        Ok(()) | Err(Interrupt::Retry) => {}
                        Err(Interrupt::Shutdown(done)) => {
                            self.finish(CloseReason::Shutdown, None);
                            if let Some(done) = done {
                                let _ = done.send(());
                            }
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Publish Reconnecting and fail everything that was waiting on the old connection
    fn enter_reconnecting(&mut self, reason: &str, delay: Duration) {
        self.shared.transition(
            ConnectionState::Reconnecting,
            Some(reason.to_string()),
            Some(delay),
        );

        let failed = self
            .registry
            .fail_all(|| SessionError::ConnectionLost(reason.to_string()));
        if failed > 0 {
            warn!("Failed {} outstanding requests: connection lost", failed);
        }
        self.internal = FuturesUnordered::new();
        self.remote_subscriptions.clear();
    }

    /// Terminal cleanup: nothing may be left waiting once Closed is published
    fn finish(&mut self, reason: CloseReason, error: Option<String>) {
        let cancelled = self.registry.fail_all(|| SessionError::Cancelled);
        if cancelled > 0 {
            info!("Cancelled {} outstanding requests", cancelled);
        }

        let shutdown = reason == CloseReason::Shutdown;
        while let Some(queued) = self.queue.pop_front() {
            let _ = queued.reply.send(Err(if shutdown {
                SessionError::Cancelled
            } else {
                SessionError::NotConnected
            }));
        }

        self.internal = FuturesUnordered::new();
        self.remote_subscriptions.clear();
        self.dispatcher.clear();
        self.shared.set_close_reason(reason);
        self.shared.transition(ConnectionState::Closed, error, None);
    }

    /// One full attempt: connect, authenticate, serve until the connection ends
    async fn connect_once(&mut self) -> Exit {
        self.shared.transition(ConnectionState::Connecting, None, None);

        let connector = self.connector.clone();
        let connect_timeout = self.config.connect_timeout();
        let connecting = async move { timeout(connect_timeout, connector.connect()).await };

        let mut transport = match self.until(connecting).await {
            Err(Interrupt::Shutdown(done)) => return Exit::Shutdown(done),
            Err(Interrupt::Retry) => return Exit::retry_now(),
            Ok(Err(_)) => {
                return Exit::lost(format!("connect timed out after {:?}", connect_timeout))
            }
            Ok(Ok(Err(e))) => return Exit::lost(e.to_string()),
            Ok(Ok(Ok(transport))) => transport,
        };

        info!("Authenticating with TrueNAS...");
        self.shared
            .transition(ConnectionState::Authenticating, None, None);

        let id = self.registry.next_id();
        let method = self.config.auth_method.clone();
        let api_key = self.api_key.clone();
        let auth_timeout = self.config.auth_timeout();
        let outcome = {
            let authenticating = timeout(
                auth_timeout,
                authenticate(transport.as_mut(), &id, &method, &api_key),
            );
            self.until(authenticating).await
        };

        let exit = match outcome {
            Err(Interrupt::Shutdown(done)) => Some(Exit::Shutdown(done)),
            Err(Interrupt::Retry) => Some(Exit::retry_now()),
            Ok(Err(_)) => Some(Exit::lost(format!(
                "no authentication response within {:?}",
                auth_timeout
            ))),
            Ok(Ok(Err(e))) => Some(Exit::lost(e.to_string())),
            Ok(Ok(Ok(AuthOutcome::Rejected(reason)))) => Some(Exit::AuthRejected(reason)),
            Ok(Ok(Ok(AuthOutcome::Accepted))) => None,
        };
        if let Some(exit) = exit {
            release(transport, &exit).await;
            return exit;
        }

        info!("Successfully authenticated to TrueNAS");
        let exit = self.serve(transport.as_mut()).await;
        release(transport, &exit).await;
        exit
    }

    /// Await `fut` while still answering commands that arrive outside Connected
    async fn until<F: Future>(&mut self, fut: F) -> std::result::Result<F::Output, Interrupt> {
        tokio::pin!(fut);
        loop {
            let queue_deadline = self.queue.front().map(|queued| queued.deadline);
            tokio::select! {
                out = &mut fut => return Ok(out),
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        return Err(Interrupt::Shutdown(None));
                    };
                    if let Some(interrupt) = self.handle_offline(cmd) {
                        return Err(interrupt);
                    }
                }
                _ = sleep_until(deadline_or_never(queue_deadline)), if queue_deadline.is_some() => {
                    self.expire_queue(Instant::now());
                }
            }
        }
    }

    fn handle_offline(&mut self, cmd: Command) -> Option<Interrupt> {
        match cmd {
            Command::Call {
                method,
                params,
                options,
                reply,
            } => match self.config.offline_calls {
                OfflineCallPolicy::FailFast => {
                    debug!("Rejecting {}: not connected", method);
                    let _ = reply.send(Err(SessionError::NotConnected));
                }
                OfflineCallPolicy::Queue {
                    capacity,
                    max_wait_ms,
                } => {
                    if self.queue.len() >= capacity {
                        warn!("Offline call queue full ({}), rejecting {}", capacity, method);
                        let _ = reply.send(Err(SessionError::NotConnected));
                    } else {
                        debug!("Queueing {} until connected", method);
                        self.queue.push_back(QueuedCall {
                            method,
                            params,
                            options,
                            reply,
                            deadline: deadline_after(
                                Instant::now(),
                                Duration::from_millis(max_wait_ms),
                            ),
                        });
                    }
                }
            },
            // Topics are replayed from the dispatcher once connected.
            Command::TopicAdded(_) | Command::TopicRemoved(_) => {}
            Command::Reconnect => return Some(Interrupt::Retry),
            Command::Shutdown { done } => return Some(Interrupt::Shutdown(Some(done))),
        }
        None
    }

    fn expire_queue(&mut self, now: Instant) {
        while self
            .queue
            .front()
            .is_some_and(|queued| queued.deadline <= now)
        {
            if let Some(queued) = self.queue.pop_front() {
                debug!("Queued {} waited too long for a connection", queued.method);
                let _ = queued.reply.send(Err(SessionError::NotConnected));
            }
        }
    }

    /// Steady state: RPCs flow until the connection fails or shutdown is requested
    async fn serve(&mut self, transport: &mut dyn Transport) -> Exit {
        self.shared.transition(ConnectionState::Connected, None, None);
        self.malformed_streak = 0;

        let stable_at = deadline_after(Instant::now(), self.config.stabilization_window());
        let mut stabilized = false;

        let heartbeat_every = self.config.heartbeat_interval();
        let period = heartbeat_every.unwrap_or(Duration::from_secs(3600));
        let mut heartbeat = interval_at(deadline_after(Instant::now(), period), period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat_in_flight = false;

        if let Err(e) = self.on_connected(transport).await {
            return Exit::lost(e.to_string());
        }

        loop {
            let expiry = self.registry.next_deadline();
            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        return Exit::Shutdown(None);
                    };
                    let sent = match cmd {
                        Command::Call { method, params, options, reply } => {
                            self.start_call(transport, method, params, options, reply).await
                        }
                        Command::TopicAdded(topic) => self.subscribe_remote(transport, topic).await,
                        Command::TopicRemoved(topic) => self.unsubscribe_remote(transport, topic).await,
                        Command::Reconnect => return Exit::retry_now(),
                        Command::Shutdown { done } => return Exit::Shutdown(Some(done)),
                    };
                    if let Err(e) = sent {
                        return Exit::lost(e.to_string());
                    }
                }
                frame = transport.recv() => match frame {
                    None => return Exit::lost("connection closed by server"),
                    Some(Err(SessionError::Protocol(reason))) => {
                        if let Some(exit) = self.on_malformed(reason) {
                            return exit;
                        }
                    }
                    Some(Err(e)) => return Exit::lost(e.to_string()),
                    Some(Ok(text)) => {
                        if let Some(exit) = self.handle_frame(&text) {
                            return exit;
                        }
                    }
                },
                _ = sleep_until(deadline_or_never(expiry)), if expiry.is_some() => {
                    let expired = self.registry.expire(Instant::now());
                    if expired > 0 {
                        warn!("{} requests timed out", expired);
                    }
                }
                _ = heartbeat.tick(), if heartbeat_every.is_some() => {
                    if !heartbeat_in_flight {
                        let method = self.config.heartbeat_method.clone();
                        let deadline = self.config.heartbeat_timeout();
                        if let Err(e) = self
                            .internal_call(transport, InternalCall::Heartbeat, method, json!([]), deadline)
                            .await
                        {
                            return Exit::lost(e.to_string());
                        }
                        heartbeat_in_flight = true;
                    }
                }
                Some((call, outcome)) = self.internal.next(), if !self.internal.is_empty() => {
                    if matches!(call, InternalCall::Heartbeat) {
                        heartbeat_in_flight = false;
                    }
                    if let Some(exit) = self.on_internal(transport, call, outcome).await {
                        return exit;
                    }
                }
                _ = sleep_until(stable_at), if !stabilized => {
                    stabilized = true;
                    debug!("Connection stable for {:?}, resetting backoff", self.config.stabilization_window());
                    self.backoff.reset();
                }
            }
        }
    }

    /// Replay server subscriptions and flush calls queued while offline
    async fn on_connected(&mut self, transport: &mut dyn Transport) -> Result<()> {
        for topic in self.dispatcher.topic_names() {
            self.subscribe_remote(transport, topic).await?;
        }

        let now = Instant::now();
        while let Some(queued) = self.queue.pop_front() {
            if queued.deadline <= now {
                let _ = queued.reply.send(Err(SessionError::NotConnected));
                continue;
            }
            self.start_call(
                transport,
                queued.method,
                queued.params,
                queued.options,
                queued.reply,
            )
            .await?;
        }
        Ok(())
    }

    /// Register a caller's request and write it to the socket.
    ///
    /// Errors returned here are transport failures; call-level errors go to `reply`.
    async fn start_call(
        &mut self,
        transport: &mut dyn Transport,
        method: String,
        params: Value,
        options: CallOptions,
        reply: oneshot::Sender<Result<PendingCall>>,
    ) -> Result<()> {
        let id = match options.id {
            Some(id) => id,
            None => self.registry.next_id(),
        };
        let call_timeout = options
            .timeout
            .unwrap_or_else(|| self.config.request_timeout());

        let pending = match self.registry.register(id.clone(), &method, call_timeout) {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Rejecting {}: {}", method, e);
                let _ = reply.send(Err(e));
                return Ok(());
            }
        };

        let text = match codec::encode(&method, &params, &id) {
            Ok(text) => text,
            Err(e) => {
                self.registry.resolve(&id, Err(SessionError::Json(e)));
                let _ = reply.send(Ok(pending));
                return Ok(());
            }
        };

        let _ = reply.send(Ok(pending));
        debug!("Sending request: {} (id {})", method, id);
        transport.send(text).await
    }

    async fn internal_call(
        &mut self,
        transport: &mut dyn Transport,
        call: InternalCall,
        method: String,
        params: Value,
        call_timeout: Duration,
    ) -> Result<()> {
        let id = self.registry.next_id();
        let pending = self.registry.register(id.clone(), &method, call_timeout)?;
        let text = codec::encode(&method, &params, &id)?;
        self.internal
            .push(Box::pin(async move { (call, pending.await) }));
        debug!("Sending request: {} (id {})", method, id);
        transport.send(text).await
    }

    async fn subscribe_remote(&mut self, transport: &mut dyn Transport, topic: String) -> Result<()> {
        if !self.config.server_subscriptions || self.remote_subscriptions.contains_key(&topic) {
            return Ok(());
        }

        info!("Subscribing to {}", topic);
        self.remote_subscriptions.insert(topic.clone(), None);
        let method = self.config.subscribe_method.clone();
        let params = json!([topic]);
        let call_timeout = self.config.request_timeout();
        self.internal_call(transport, InternalCall::Subscribe(topic), method, params, call_timeout)
            .await
    }

    async fn unsubscribe_remote(
        &mut self,
        transport: &mut dyn Transport,
        topic: String,
    ) -> Result<()> {
        // A subscribe still in flight is cancelled when its result arrives.
        let Some(Some(server_id)) = self.remote_subscriptions.remove(&topic) else {
            return Ok(());
        };
        self.send_unsubscribe(transport, topic, server_id).await
    }

    async fn send_unsubscribe(
        &mut self,
        transport: &mut dyn Transport,
        topic: String,
        server_id: Value,
    ) -> Result<()> {
        info!("Unsubscribing from {}", topic);
        let method = self.config.unsubscribe_method.clone();
        let call_timeout = self.config.request_timeout();
        self.internal_call(
            transport,
            InternalCall::Unsubscribe(topic),
            method,
            json!([server_id]),
            call_timeout,
        )
        .await
    }

    async fn on_internal(
        &mut self,
        transport: &mut dyn Transport,
        call: InternalCall,
        outcome: Result<Value>,
    ) -> Option<Exit> {
        match (call, outcome) {
            (InternalCall::Heartbeat, Ok(_)) => debug!("Heartbeat acknowledged"),
            (InternalCall::Heartbeat, Err(e @ SessionError::Timeout { .. })) => {
                return Some(Exit::lost(format!("heartbeat unanswered: {}", e)));
            }
            // An error reply still proves the server is alive.
            (InternalCall::Heartbeat, Err(e)) => warn!("Heartbeat returned an error: {}", e),
            (InternalCall::Subscribe(topic), Ok(server_id)) => {
                let wanted = self.dispatcher.has_topic(&topic)
                    && matches!(self.remote_subscriptions.get(&topic), Some(None));
                if wanted {
                    debug!("Subscribed to {} ({})", topic, server_id);
                    self.remote_subscriptions.insert(topic, Some(server_id));
                } else if let Err(e) = self.send_unsubscribe(transport, topic, server_id).await {
                    return Some(Exit::lost(e.to_string()));
                }
            }
            (InternalCall::Subscribe(topic), Err(e)) => {
                warn!("Failed to subscribe to {}: {}", topic, e);
                self.remote_subscriptions.remove(&topic);
            }
            (InternalCall::Unsubscribe(topic), Ok(_)) => debug!("Unsubscribed from {}", topic),
            (InternalCall::Unsubscribe(topic), Err(e)) => {
                warn!("Failed to unsubscribe from {}: {}", topic, e)
            }
        }
        None
    }

    fn handle_frame(&mut self, text: &str) -> Option<Exit> {
        match codec::decode(text) {
            Frame::Response { id, outcome } => {
                self.malformed_streak = 0;
                let expired_session = matches!(&outcome, Err(e) if e.is_not_authenticated());
                self.registry.resolve(&id, outcome.map_err(SessionError::Rpc));
                if expired_session {
                    // Session expired server side; a fresh connection re-authenticates.
                    return Some(Exit::lost("session is no longer authenticated"));
                }
            }
            Frame::Notification { topic, payload } => {
                self.malformed_streak = 0;
                let report = self.dispatcher.dispatch(&topic, &payload);
                debug!(
                    "Notification {} delivered to {} handlers ({} failed)",
                    topic, report.delivered, report.failed
                );
            }
            Frame::Request { id, method, .. } => {
                self.malformed_streak = 0;
                warn!("Ignoring {} request (id {}) sent by the server", method, id);
            }
            Frame::Malformed { reason } => return self.on_malformed(reason),
        }
        None
    }

    fn on_malformed(&mut self, reason: String) -> Option<Exit> {
        self.malformed_streak += 1;
        let error = SessionError::Protocol(reason);
        warn!("Discarding frame ({} in a row): {}", self.malformed_streak, error);

        (self.malformed_streak > self.config.malformed_frame_threshold).then(|| {
            Exit::lost(format!(
                "{} consecutive malformed frames",
                self.malformed_streak
            ))
        })
    }
}

/// Send the login call and wait for its response on a fresh transport
async fn authenticate(
    transport: &mut dyn Transport,
    id: &RequestId,
    method: &str,
    api_key: &SecretString,
) -> Result<AuthOutcome> {
    let params = json!([api_key.expose_secret().trim()]);
    let request = codec::encode(method, &params, id)?;
    debug!("Sending auth request");
    transport.send(request).await?;

    loop {
        let text = match transport.recv().await {
            None => {
                return Err(SessionError::ConnectionLost(
                    "connection closed during authentication".to_string(),
                ))
            }
            Some(Err(e)) => return Err(e),
            Some(Ok(text)) => text,
        };

        match codec::decode(&text) {
            Frame::Response {
                id: response_id,
                outcome,
            } if &response_id == id => {
                return Ok(match outcome {
                    Ok(Value::Bool(true)) => AuthOutcome::Accepted,
                    Ok(other) => AuthOutcome::Rejected(format!(
                        "API key rejected by TrueNAS (result: {})",
                        other
                    )),
                    Err(error) => AuthOutcome::Rejected(error.to_string()),
                });
            }
            other => debug!("Ignoring frame while authenticating: {:?}", other),
        }
    }
}

/// Close a finished transport. A lost connection is closed in the background so its
/// callers fail and Reconnecting is published without waiting on the close handshake.
async fn release(mut transport: Box<dyn Transport>, exit: &Exit) {
    match exit {
        Exit::Lost { .. } => {
            tokio::spawn(async move { close_quietly(transport.as_mut()).await });
        }
        Exit::Shutdown(_) | Exit::AuthRejected(_) => close_quietly(transport.as_mut()).await,
    }
}

async fn close_quietly(transport: &mut dyn Transport) {
    if timeout(Duration::from_secs(1), transport.close()).await.is_err() {
        debug!("Timed out closing transport");
    }
}

fn deadline_or_never(deadline: Option<Instant>) -> Instant {
    // Only polled when the branch guard holds; the fallback just has to be valid.
    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400))
}
