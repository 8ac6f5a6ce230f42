//! Connection state and its observers
//!
//! ```text
//! Disconnected → Connecting → Authenticating → Connected
//!                    ↑              │              │
//!                    └──── Reconnecting ◄──────────┘
//!                               │
//!                               ▼
//!                             Closed   (shutdown, auth rejected, retries exhausted)
//! ```
//!
//! A device backed by the session is available exactly while the state is
//! [`ConnectionState::Connected`].

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn is_available(self) -> bool {
        self == ConnectionState::Connected
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }

    pub const ALL: [ConnectionState; 6] = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Authenticating,
        ConnectionState::Connected,
        ConnectionState::Reconnecting,
        ConnectionState::Closed,
    ];
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One state transition as seen by observers
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// What caused the transition, if it was a failure
    pub error: Option<String>,
    /// Delay before the next attempt when entering Reconnecting
    pub retry_in: Option<Duration>,
}

/// Why a session reached Closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Shutdown,
    AuthenticationFailed(String),
    RetriesExhausted(String),
}

pub type StateObserver = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// State shared between the session facade and the connection worker
pub(crate) struct SharedState {
    state: watch::Sender<ConnectionState>,
    observers: Mutex<Vec<StateObserver>>,
    last_error: Mutex<Option<String>>,
    close_reason: Mutex<Option<CloseReason>>,
}

impl SharedState {
    pub(crate) fn new() -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            state,
            observers: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
            close_reason: Mutex::new(None),
        })
    }

    pub(crate) fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn add_observer(&self, observer: StateObserver) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_close_reason(&self, reason: CloseReason) {
        *self.close_reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
    }

    /// Move to `to` and notify observers before returning. Same-state moves are ignored.
    pub(crate) fn transition(
        &self,
        to: ConnectionState,
        error: Option<String>,
        retry_in: Option<Duration>,
    ) {
        let from = self.current();
        if from == to {
            return;
        }

        match (&error, retry_in) {
            (Some(e), Some(delay)) => {
                warn!("Connection {} -> {}: {} (retrying in {:?})", from, to, e, delay)
            }
            (Some(e), None) => warn!("Connection {} -> {}: {}", from, to, e),
            _ => info!("Connection {} -> {}", from, to),
        }

        if let Some(e) = &error {
            *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.clone());
        }
        self.state.send_replace(to);

        let change = StateChange {
            from,
            to,
            error,
            retry_in,
        };
        let observers: Vec<StateObserver> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in &observers {
            if catch_unwind(AssertUnwindSafe(|| observer(&change))).is_err() {
                warn!("State observer panicked on {} -> {}", change.from, change.to);
            }
        }
    }
}
