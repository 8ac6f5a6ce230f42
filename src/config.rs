use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub truenas: TrueNasConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrueNasConfig {
    pub host: String,
    pub api_key: SecretString,
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
    #[serde(default = "default_endpoint_path")]
    pub endpoint_path: String,
}

impl TrueNasConfig {
    /// Websocket URL of the JSON-RPC endpoint
    pub fn websocket_url(&self) -> String {
        let protocol = if self.use_tls { "wss" } else { "ws" };
        let path = if self.endpoint_path.starts_with('/') {
            self.endpoint_path.clone()
        } else {
            format!("/{}", self.endpoint_path)
        };
        format!("{}://{}{}", protocol, self.host, path)
    }
}

/// Tuning for the session worker: timeouts, heartbeat, reconnect backoff.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub auth_timeout_secs: u64,
    /// Zero disables the heartbeat.
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_secs: u64,
    pub backoff_factor: f64,
    pub retry_jitter: bool,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub stabilization_window_secs: u64,
    pub malformed_frame_threshold: u32,
    pub offline_calls: OfflineCallPolicy,
    pub server_subscriptions: bool,
    pub auth_method: String,
    pub heartbeat_method: String,
    pub subscribe_method: String,
    pub unsubscribe_method: String,
}

/// What `call()` does while the session is not Connected
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OfflineCallPolicy {
    FailFast,
    Queue { capacity: usize, max_wait_ms: u64 },
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            auth_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 10,
            initial_retry_delay_ms: 1000,
            max_retry_delay_secs: 60,
            backoff_factor: 2.0,
            retry_jitter: true,
            max_retries: None,
            stabilization_window_secs: 30,
            malformed_frame_threshold: 5,
            offline_calls: OfflineCallPolicy::FailFast,
            server_subscriptions: true,
            auth_method: "auth.login_with_api_key".to_string(),
            heartbeat_method: "core.ping".to_string(),
            subscribe_method: "core.subscribe".to_string(),
            unsubscribe_method: "core.unsubscribe".to_string(),
        }
    }
}

/// Upper bound for every timeout and interval in [`SessionConfig`]
pub const MAX_SETTING_DURATION: Duration = Duration::from_secs(86_400 * 365);

impl SessionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn stabilization_window(&self) -> Duration {
        Duration::from_secs(self.stabilization_window_secs)
    }

    /// Reject values the session worker cannot run with
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::SessionError;

        for (name, secs) in [
            ("request_timeout_secs", self.request_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("auth_timeout_secs", self.auth_timeout_secs),
        ] {
            if secs == 0 {
                return Err(SessionError::Config(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        let mut durations = vec![
            ("request_timeout_secs", self.request_timeout()),
            ("connect_timeout_secs", self.connect_timeout()),
            ("auth_timeout_secs", self.auth_timeout()),
            ("heartbeat_interval_secs", Duration::from_secs(self.heartbeat_interval_secs)),
            ("heartbeat_timeout_secs", self.heartbeat_timeout()),
            ("max_retry_delay_secs", Duration::from_secs(self.max_retry_delay_secs)),
            ("stabilization_window_secs", self.stabilization_window()),
        ];
        if let OfflineCallPolicy::Queue { max_wait_ms, .. } = self.offline_calls {
            durations.push(("offline max_wait_ms", Duration::from_millis(max_wait_ms)));
        }
        for (name, duration) in durations {
            if duration > MAX_SETTING_DURATION {
                return Err(SessionError::Config(format!(
                    "{} must not exceed {} seconds",
                    name,
                    MAX_SETTING_DURATION.as_secs()
                )));
            }
        }
        if self.initial_retry_delay_ms == 0 {
            return Err(SessionError::Config(
                "initial_retry_delay_ms must be greater than zero".to_string(),
            ));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(SessionError::Config(format!(
                "backoff_factor must be at least 1.0, got {}",
                self.backoff_factor
            )));
        }
        if Duration::from_millis(self.initial_retry_delay_ms)
            > Duration::from_secs(self.max_retry_delay_secs)
        {
            return Err(SessionError::Config(
                "initial_retry_delay_ms exceeds max_retry_delay_secs".to_string(),
            ));
        }
        if let OfflineCallPolicy::Queue { capacity: 0, .. } = self.offline_calls {
            return Err(SessionError::Config(
                "offline call queue capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Event topics to subscribe to, e.g. `alert.list`
    #[serde(default)]
    pub topics: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            topics: Vec::new(),
        }
    }
}

fn default_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9100
}

fn default_use_tls() -> bool {
    true
}

fn default_verify_ssl() -> bool {
    true
}

fn default_endpoint_path() -> String {
    "/api/current".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        // Load environment variables from .env if present
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("TRUENAS_SESSION").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let config: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config
            .session
            .validate()
            .context("Invalid session configuration")?;

        Ok(config)
    }
}
