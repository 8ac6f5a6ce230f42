//! TrueNAS Session
//!
//! A persistent JSON-RPC 2.0 session with a TrueNAS Scale appliance over its websocket
//! API, built for long-running consumers such as home automation integrations.
//!
//! # Overview
//!
//! One [`truenas::TrueNasSession`] owns one websocket connection. It authenticates with
//! an API key, multiplexes concurrent calls over the connection, routes server-pushed
//! events to subscribed handlers, and reconnects with exponential backoff whenever the
//! link drops. Consumers treat the appliance as available exactly while the session is
//! Connected.
//!
//! # Architecture
//!
//! ```text
//!  caller ──call()──► TrueNasSession ──command──► connection worker ──frame──► TrueNAS
//!                          │                        │   ▲
//!                    subscribe()              registry  │ responses
//!                          ▼                        │   │
//!                 SubscriptionDispatcher ◄── notifications
//! ```
//!
//! # Modules
//!
//! - [`truenas`] - Session, connection worker, codec, registry, dispatcher
//! - [`config`] - Configuration management
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus metrics for the monitor binary
//! - [`server`] - Monitor HTTP server and poll loop
//!
//! # Quick Start
//!
//! ```no_run
//! use truenas_session::{config::Config, truenas::TrueNasSession};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/Default.toml")?;
//!     let session = TrueNasSession::connect(&config.truenas, config.session).await?;
//!     let info = session.call("system.info", serde_json::json!([])).await?;
//!     println!("{}", info);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod server;
pub mod truenas;
