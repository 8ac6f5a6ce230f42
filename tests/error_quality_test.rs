//! Error message quality tests
//!
//! Tests that verify error messages are helpful and distinguishable.

use serde_json::json;
use std::time::Duration;
use truenas_session::error::SessionError;
use truenas_session::truenas::types::{RequestId, RpcError};

#[test]
fn test_auth_error_message_clarity() {
    // Given: An authentication error
    let error = SessionError::AuthenticationFailed("API key rejected".to_string());

    // When: Converting to string
    let message = format!("{}", error);

    // Then: Message should clearly indicate authentication issue
    assert!(message.contains("Authentication failed"));
    assert!(message.contains("API key rejected"));
}

#[test]
fn test_timeout_names_method_and_duration() {
    // Given: A timed out call
    let error = SessionError::Timeout {
        method: "pool.dataset.query".to_string(),
        timeout: Duration::from_secs(30),
    };

    // When: Converting to string
    let message = format!("{}", error);

    // Then: The reader can tell which call and how long it waited
    assert!(message.contains("timed out"));
    assert!(message.contains("pool.dataset.query"));
    assert!(message.contains("30s"));
}

#[test]
fn test_rpc_error_carries_server_message() {
    // Given: An error returned by TrueNAS
    let error = SessionError::Rpc(RpcError {
        code: 22,
        message: "Pool tank not found".to_string(),
        data: Some(json!({"errname": "ENOENT"})),
    });

    // When: Converting to string
    let message = format!("{}", error);

    // Then: Server message and code are both visible
    assert!(message.contains("TrueNAS API error"));
    assert!(message.contains("Pool tank not found"));
    assert!(message.contains("22"));
}

#[test]
fn test_websocket_error_message_clarity() {
    // Given: A WebSocket error (needs a tungstenite::Error)
    use tungstenite::error::Error as WsError;
    use tungstenite::error::ProtocolError;

    let ws_err = WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake);
    let error = SessionError::WebSocket(ws_err);

    // When: Converting to string
    let message = format!("{}", error);

    // Then: Message should clearly indicate WebSocket issue
    assert!(message.contains("WebSocket error"));
    assert!(error.is_transport());
}

#[test]
fn test_json_error_message_clarity() {
    // Given: A JSON parsing error
    let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
    let error = SessionError::from(json_err);

    // When: Converting to string
    let message = format!("{}", error);

    // Then: Message should clearly indicate JSON issue
    assert!(message.contains("JSON error"));
}

#[test]
fn test_duplicate_id_names_the_id() {
    // Given: A rejected duplicate id
    let error = SessionError::DuplicateId(RequestId::from("refresh-1"));

    // When: Converting to string
    let message = format!("{}", error);

    // Then: The id is shown
    assert!(message.contains("refresh-1"));
}

#[test]
fn test_error_messages_are_distinguishable() {
    // Given: Different error types
    let lost = format!("{}", SessionError::ConnectionLost("test".to_string()));
    let auth = format!("{}", SessionError::AuthenticationFailed("test".to_string()));
    let protocol = format!("{}", SessionError::Protocol("test".to_string()));
    let config = format!("{}", SessionError::Config("test".to_string()));
    let offline = format!("{}", SessionError::NotConnected);
    let cancelled = format!("{}", SessionError::Cancelled);

    // When: Comparing error messages
    // Then: Each should have a unique prefix
    assert!(lost.starts_with("Connection lost"));
    assert!(auth.starts_with("Authentication failed"));
    assert!(protocol.starts_with("Protocol error"));
    assert!(config.starts_with("Configuration error"));

    // All should be different
    let all = [lost, auth, protocol, config, offline, cancelled];
    for (i, a) in all.iter().enumerate() {
        for b in &all[i + 1..] {
            assert_ne!(a, b);
        }
    }
}

#[test]
fn test_transport_errors_are_classified() {
    // Given: Errors from the link and from the call itself
    let lost = SessionError::ConnectionLost("reset".to_string());
    let not_connected = SessionError::NotConnected;
    let timeout = SessionError::Timeout {
        method: "core.ping".to_string(),
        timeout: Duration::from_secs(1),
    };

    // Then: Only the link failure counts as transport
    assert!(lost.is_transport());
    assert!(!not_connected.is_transport());
    assert!(!timeout.is_transport());
}

#[test]
fn test_error_debug_format() {
    // Given: An error instance
    let error = SessionError::AuthenticationFailed("Invalid credentials".to_string());

    // When: Using debug format
    let debug_message = format!("{:?}", error);

    // Then: Should include variant name and details
    assert!(debug_message.contains("AuthenticationFailed"));
    assert!(debug_message.contains("Invalid credentials"));
}
