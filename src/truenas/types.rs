//! TrueNAS JSON-RPC Type Definitions
//!
//! Wire envelopes for the JSON-RPC 2.0 protocol spoken on `/api/current`, plus the
//! handful of API payloads the monitor binary reads.
//!
//! # JSON-RPC Protocol
//!
//! - [`JsonRpcRequest`] - Outgoing method calls
//! - [`RequestId`] - Correlation id (number or string)
//! - [`RpcError`] - `error` member of a failed response
//!
//! # API Endpoints Covered
//!
//! - `system.info` → [`SystemInfo`]
//!
//! Everything else travels as opaque `serde_json::Value`.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

/// Correlation id linking a request to its response
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

/// JSON-RPC 2.0 request
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: &'a RequestId,
    pub method: &'a str,
    pub params: &'a serde_json::Value,
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    /// TrueNAS error name (`ENOENT`, `ENOTAUTHENTICATED`, ...) carried in `data.errname`
    pub fn errname(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|data| data.get("errname"))
            .and_then(|name| name.as_str())
    }

    /// The server dropped our authentication for this connection
    pub fn is_not_authenticated(&self) -> bool {
        self.errname() == Some("ENOTAUTHENTICATED") || self.message.contains("ENOTAUTHENTICATED")
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// System information from system.info
#[derive(Debug, Deserialize)]
pub struct SystemInfo {
    pub version: String,
    pub hostname: String,
    #[serde(default)]
    pub uptime_seconds: f64,
    #[serde(default)]
    pub loadavg: Option<Vec<f64>>,
    #[serde(default)]
    pub physmem: Option<u64>,
}
