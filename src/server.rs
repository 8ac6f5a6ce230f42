//! Session Monitor HTTP Server
//!
//! Runs one [`TrueNasSession`] the way a host integration would and exposes what it
//! sees over HTTP.
//!
//! # Endpoints
//!
//! - `GET /` - HTML landing page with links to metrics and health
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /health` - 200 while the session is Connected, 503 otherwise
//!
//! # Background work
//!
//! - **State observer**: mirrors every connection transition into the metrics
//! - **Topic handlers**: count notifications for each configured topic
//! - **Poll loop**: calls `system.info` every `poll_interval_seconds` while Connected

use crate::config::Config;
use crate::metrics::SessionMetrics;
use crate::truenas::types::SystemInfo;
use crate::truenas::TrueNasSession;
use anyhow::Context;
use axum::{
    extract::State,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde_json::json;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

#[derive(Clone)]
struct AppState {
    metrics: SessionMetrics,
    session: TrueNasSession,
}

pub async fn start(config: Config) -> anyhow::Result<()> {
    let metrics = SessionMetrics::new()?;
    let session = TrueNasSession::start(&config.truenas, config.session.clone())
        .context("Failed to start TrueNAS session")?;

    let observer_metrics = metrics.clone();
    session.on_state_change(move |change| observer_metrics.record_transition(change));
    // Catch up with transitions that happened before the observer was registered
    metrics.set_state(session.connection_state());

    for topic in &config.monitor.topics {
        let topic_metrics = metrics.clone();
        let name = topic.clone();
        session.subscribe(topic, move |payload| {
            debug!("Event on {}: {}", name, payload);
            topic_metrics.record_notification(&name);
            Ok(())
        });
    }

    let state = AppState {
        metrics: metrics.clone(),
        session: session.clone(),
    };

    let poll_state = state.clone();
    let poll_interval = Duration::from_secs(config.monitor.poll_interval_seconds.max(1));
    let poller = tokio::spawn(async move {
        poll_loop(poll_state, poll_interval).await;
    });

    let app = Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = format!("{}:{}", config.server.addr, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Monitor listening on {}", addr);
    info!("Metrics available at http://{}/metrics", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    poller.abort();
    session.disconnect().await;
    served?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn poll_loop(state: AppState, every: Duration) {
    let mut ticker = interval(every);

    loop {
        ticker.tick().await;

        if !state.session.is_available() {
            debug!("Connection not yet ready, skipping poll");
            continue;
        }

        match state
            .session
            .query::<SystemInfo>("system.info", json!([]))
            .await
        {
            Ok(info) => {
                state.metrics.record_call("system.info", "success");
                state.metrics.record_system_info(&info);
                debug!("Updated system info for {}", info.hostname);
            }
            Err(e) if e.is_transport() => {
                state.metrics.record_call("system.info", "connection");
                warn!("system.info interrupted: {}", e);
            }
            Err(e) => {
                state.metrics.record_call("system.info", "error");
                warn!("Failed to query system.info: {}", e);
            }
        }
    }
}

async fn root_handler() -> impl IntoResponse {
    r#"<html>
<head><title>TrueNAS Session Monitor</title></head>
<body>
<h1>TrueNAS Session Monitor</h1>
<p><a href="/metrics">Metrics</a></p>
<p><a href="/health">Health</a></p>
</body>
</html>"#
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(metrics) => metrics.into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error rendering metrics: {}", e),
            )
                .into_response()
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let current = state.session.connection_state();

    if current.is_available() {
        (axum::http::StatusCode::OK, "OK".to_string())
    } else {
        (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            format!("TrueNAS session {}", current),
        )
    }
}
