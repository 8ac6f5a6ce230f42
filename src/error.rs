use crate::truenas::types::{RequestId, RpcError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Request timed out: {method} got no response within {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Duplicate request id: {0}")]
    DuplicateId(RequestId),

    #[error("Not connected to TrueNAS")]
    NotConnected,

    #[error("Session cancelled")]
    Cancelled,

    #[error("TrueNAS API error: {0}")]
    Rpc(RpcError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// True for errors that mean the link went away rather than the call being wrong.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectionLost(_) | SessionError::WebSocket(_) | SessionError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
