//! Prometheus Metrics Definitions
//!
//! Metrics exported by the monitor binary about its TrueNAS session.
//!
//! # Metric Categories
//!
//! ## Connection
//! - `truenas_up` - 1 while the session is Connected
//! - `truenas_connection_state` - one-hot gauge labelled by state
//! - `truenas_connection_transitions_total` - transitions by target state
//!
//! ## Traffic
//! - `truenas_calls_total` - calls by method and outcome
//! - `truenas_notifications_total` - notifications by topic
//!
//! ## System
//! - `truenas_system_info` - labelled with version and hostname
//! - `truenas_system_uptime_seconds`, `truenas_system_load_average`, `truenas_system_memory_total_bytes`
//!
//! All metrics use the `truenas_` namespace prefix.

use crate::truenas::state::{ConnectionState, StateChange};
use crate::truenas::types::SystemInfo;
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics for one monitored session
#[derive(Clone)]
pub struct SessionMetrics {
    registry: Arc<Registry>,

    // Connection metrics
    pub up: Arc<Gauge>,
    pub connection_state: Arc<IntGaugeVec>,
    pub transitions_total: Arc<IntCounterVec>,

    // Traffic metrics
    pub calls_total: Arc<IntCounterVec>,
    pub notifications_total: Arc<IntCounterVec>,

    // System metrics
    pub system_info: Arc<IntGaugeVec>,
    pub system_uptime_seconds: Arc<Gauge>,
    pub system_load_average: Arc<GaugeVec>,
    pub system_memory_total_bytes: Arc<Gauge>,
}

impl SessionMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let up = Gauge::with_opts(
            Opts::new("up", "TrueNAS session connected (1=connected, 0=unavailable)")
                .namespace("truenas"),
        )?;

        let connection_state = IntGaugeVec::new(
            Opts::new(
                "connection_state",
                "Current session state (1 for the active state, 0 otherwise)",
            )
            .namespace("truenas"),
            &["state"],
        )?;

        let transitions_total = IntCounterVec::new(
            Opts::new(
                "connection_transitions_total",
                "Session state transitions by target state",
            )
            .namespace("truenas"),
            &["state"],
        )?;

        let calls_total = IntCounterVec::new(
            Opts::new("calls_total", "JSON-RPC calls by method and outcome").namespace("truenas"),
            &["method", "outcome"],
        )?;

        let notifications_total = IntCounterVec::new(
            Opts::new("notifications_total", "Notifications received by topic")
                .namespace("truenas"),
            &["topic"],
        )?;

        let system_info = IntGaugeVec::new(
            Opts::new("system_info", "System information").namespace("truenas"),
            &["version", "hostname"],
        )?;

        let system_uptime_seconds = Gauge::with_opts(
            Opts::new("system_uptime_seconds", "System uptime in seconds").namespace("truenas"),
        )?;

        let system_load_average = GaugeVec::new(
            Opts::new("system_load_average", "System load average").namespace("truenas"),
            &["period"],
        )?;

        let system_memory_total_bytes = Gauge::with_opts(
            Opts::new("system_memory_total_bytes", "Total physical memory in bytes")
                .namespace("truenas"),
        )?;

        registry.register(Box::new(up.clone()))?;
        registry.register(Box::new(connection_state.clone()))?;
        registry.register(Box::new(transitions_total.clone()))?;
        registry.register(Box::new(calls_total.clone()))?;
        registry.register(Box::new(notifications_total.clone()))?;
        registry.register(Box::new(system_info.clone()))?;
        registry.register(Box::new(system_uptime_seconds.clone()))?;
        registry.register(Box::new(system_load_average.clone()))?;
        registry.register(Box::new(system_memory_total_bytes.clone()))?;

        let metrics = Self {
            registry: Arc::new(registry),
            up: Arc::new(up),
            connection_state: Arc::new(connection_state),
            transitions_total: Arc::new(transitions_total),
            calls_total: Arc::new(calls_total),
            notifications_total: Arc::new(notifications_total),
            system_info: Arc::new(system_info),
            system_uptime_seconds: Arc::new(system_uptime_seconds),
            system_load_average: Arc::new(system_load_average),
            system_memory_total_bytes: Arc::new(system_memory_total_bytes),
        };
        metrics.set_state(ConnectionState::Disconnected);
        Ok(metrics)
    }

    /// Reflect the session state; `up` follows availability exactly
    pub fn set_state(&self, state: ConnectionState) {
        for candidate in ConnectionState::ALL {
            self.connection_state
                .with_label_values(&[candidate.as_str()])
                .set(i64::from(candidate == state));
        }
        self.up.set(if state.is_available() { 1.0 } else { 0.0 });
    }

    pub fn record_transition(&self, change: &StateChange) {
        self.transitions_total
            .with_label_values(&[change.to.as_str()])
            .inc();
        self.set_state(change.to);
    }

    pub fn record_call(&self, method: &str, outcome: &str) {
        self.calls_total.with_label_values(&[method, outcome]).inc();
    }

    pub fn record_notification(&self, topic: &str) {
        self.notifications_total.with_label_values(&[topic]).inc();
    }

    pub fn record_system_info(&self, info: &SystemInfo) {
        self.system_info.reset();
        self.system_info
            .with_label_values(&[&info.version, &info.hostname])
            .set(1);
        self.system_uptime_seconds.set(info.uptime_seconds);

        if let Some(loadavg) = &info.loadavg {
            for (period, value) in ["1m", "5m", "15m"].iter().zip(loadavg) {
                self.system_load_average
                    .with_label_values(&[period])
                    .set(*value);
            }
        }
        if let Some(physmem) = info.physmem {
            self.system_memory_total_bytes.set(physmem as f64);
        }
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
