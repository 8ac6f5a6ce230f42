//! TrueNAS Session
//!
//! The public face of the crate: one [`TrueNasSession`] per configured appliance.
//!
//! # Example
//!
//! ```no_run
//! use truenas_session::config::{SessionConfig, TrueNasConfig};
//! use truenas_session::truenas::TrueNasSession;
//! use secrecy::SecretString;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = TrueNasConfig {
//!     host: "truenas.local:443".to_string(),
//!     api_key: SecretString::from("your-api-key"),
//!     use_tls: true,
//!     verify_ssl: false,
//!     endpoint_path: "/api/current".to_string(),
//! };
//!
//! let session = TrueNasSession::connect(&config, SessionConfig::default()).await?;
//! session.on_state_change(|change| println!("available: {}", change.to.is_available()));
//! session.subscribe("alert.list", |event| {
//!     println!("alert event: {}", event);
//!     Ok(())
//! });
//!
//! let info = session.call("system.info", serde_json::json!([])).await?;
//! println!("{}", info);
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

use crate::config::{SessionConfig, TrueNasConfig};
use crate::error::{Result, SessionError};
use crate::truenas::connection::{Command, ConnectionManager};
use crate::truenas::dispatcher::{SubscriptionDispatcher, SubscriptionHandle};
use crate::truenas::state::{CloseReason, ConnectionState, SharedState, StateChange};
use crate::truenas::transport::{Connector, WsConnector};
use crate::truenas::types::RequestId;
use secrecy::SecretString;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Fixed correlation id instead of the next generated one
    pub id: Option<RequestId>,
    /// Overrides the session's request timeout
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Persistent JSON-RPC session with one TrueNAS appliance
///
/// Cheap to clone; all clones share the connection. The connection worker stops once
/// [`disconnect`](Self::disconnect) is called or the last clone is dropped.
#[derive(Clone)]
pub struct TrueNasSession {
    inner: Arc<Inner>,
}

struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    dispatcher: Arc<SubscriptionDispatcher>,
    shared: Arc<SharedState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TrueNasSession {
    /// Start the connection worker without waiting for the first connection
    pub fn start(config: &TrueNasConfig, session: SessionConfig) -> Result<Self> {
        let connector = WsConnector::new(config);
        info!("Starting TrueNAS session for {}", connector.url());
        Self::start_with_connector(Arc::new(connector), config.api_key.clone(), session)
    }

    /// Start a session over a custom transport
    pub fn start_with_connector(
        connector: Arc<dyn Connector>,
        api_key: SecretString,
        session: SessionConfig,
    ) -> Result<Self> {
        session.validate()?;

        let (commands, receiver) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(SubscriptionDispatcher::new());
        let shared = SharedState::new();

        let manager = ConnectionManager::new(
            session,
            api_key,
            connector,
            receiver,
            dispatcher.clone(),
            shared.clone(),
        );
        let worker = tokio::spawn(manager.run());

        Ok(Self {
            inner: Arc::new(Inner {
                commands,
                dispatcher,
                shared,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    /// Start a session and wait until it is Connected.
    ///
    /// Transport failures are retried in the background, so this only returns an error
    /// once the session is Closed (e.g. the API key was rejected). Wrap it in
    /// `tokio::time::timeout` to bound the wait.
    pub async fn connect(config: &TrueNasConfig, session: SessionConfig) -> Result<Self> {
        let session = Self::start(config, session)?;
        session.wait_until_connected().await?;
        Ok(session)
    }

    /// Resolve once Connected, or with the terminal error once Closed
    pub async fn wait_until_connected(&self) -> Result<()> {
        let mut state = self.inner.shared.subscribe();
        loop {
            match *state.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(self.terminal_error()),
                _ => {}
            }
            if state.changed().await.is_err() {
                return Err(self.terminal_error());
            }
        }
    }

    /// Call `method` and wait for its result
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.call_with(method, params, CallOptions::default()).await
    }

    pub async fn call_with(&self, method: &str, params: Value, options: CallOptions) -> Result<Value> {
        let (reply, registered) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Call {
                method: method.to_string(),
                params,
                options,
                reply,
            })
            .map_err(|_| self.call_closed_error())?;

        let pending = registered.await.map_err(|_| self.call_closed_error())??;
        pending.await
    }

    /// Call `method` and deserialize the result
    pub async fn query<T>(&self, method: &str, params: Value) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let result = self.call(method, params).await?;
        serde_json::from_value(result).map_err(SessionError::Json)
    }

    /// Register `handler` for notifications on `topic`
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let (handle, first) = self.inner.dispatcher.subscribe(topic, Arc::new(handler));
        if first {
            // A closed worker has nothing left to subscribe on.
            let _ = self
                .inner
                .commands
                .send(Command::TopicAdded(topic.to_string()));
        }
        handle
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        match self.inner.dispatcher.unsubscribe(handle) {
            Some(last) => {
                if last {
                    let _ = self
                        .inner
                        .commands
                        .send(Command::TopicRemoved(handle.topic().to_string()));
                }
                true
            }
            None => false,
        }
    }

    /// Topics with at least one handler
    pub fn topics(&self) -> Vec<String> {
        self.inner.dispatcher.topic_names()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.shared.current()
    }

    /// True exactly while Connected
    pub fn is_available(&self) -> bool {
        self.connection_state().is_available()
    }

    /// Receiver for the latest state. Intermediate states may be coalesced; use
    /// [`on_state_change`](Self::on_state_change) to see every transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.subscribe()
    }

    /// Run `observer` synchronously on every transition. Keep it short; it runs on the
    /// connection worker.
    pub fn on_state_change<F>(&self, observer: F)
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.inner.shared.add_observer(Arc::new(observer));
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.shared.last_error()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.shared.close_reason()
    }

    /// Drop the current connection and reconnect now, skipping any backoff wait
    pub fn force_reconnect(&self) {
        let _ = self.inner.commands.send(Command::Reconnect);
    }

    /// Close the connection, cancel outstanding calls and stop the worker
    pub async fn disconnect(&self) {
        let (done, closed) = oneshot::channel();
        if self.inner.commands.send(Command::Shutdown { done }).is_ok() {
            let _ = closed.await;
        }
        if let Some(worker) = self.inner.worker.lock().await.take() {
            let _ = worker.await;
        }
        info!("TrueNAS session closed");
    }

    fn terminal_error(&self) -> SessionError {
        match self.inner.shared.close_reason() {
            Some(CloseReason::AuthenticationFailed(reason)) => {
                SessionError::AuthenticationFailed(reason)
            }
            Some(CloseReason::RetriesExhausted(reason)) => SessionError::ConnectionLost(reason),
            Some(CloseReason::Shutdown) => SessionError::Cancelled,
            None => SessionError::NotConnected,
        }
    }

    fn call_closed_error(&self) -> SessionError {
        match self.inner.shared.close_reason() {
            Some(CloseReason::Shutdown) => SessionError::Cancelled,
            _ => SessionError::NotConnected,
        }
    }
}
