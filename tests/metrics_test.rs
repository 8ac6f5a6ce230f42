use std::time::Duration;
use truenas_session::metrics::SessionMetrics;
use truenas_session::truenas::types::SystemInfo;
use truenas_session::truenas::{ConnectionState, StateChange};

#[test]
fn test_metrics_registration() {
    // Verify that all metrics can be created and registered without panicking
    let metrics = SessionMetrics::new().expect("Failed to create session metrics");

    let output = metrics.render().expect("Failed to render metrics");
    assert!(output.contains("truenas_up 0"), "Missing truenas_up metric");
    assert!(
        output.contains("truenas_connection_state{state=\"disconnected\"} 1"),
        "Initial state should be disconnected"
    );
    assert!(
        output.contains("truenas_system_uptime_seconds"),
        "Missing system uptime metric"
    );
    assert!(
        output.contains("truenas_system_memory_total_bytes"),
        "Missing total memory metric"
    );
}

#[test]
fn test_transition_updates_state_gauges() {
    let metrics = SessionMetrics::new().expect("Failed to create session metrics");

    metrics.record_transition(&StateChange {
        from: ConnectionState::Authenticating,
        to: ConnectionState::Connected,
        error: None,
        retry_in: None,
    });

    let output = metrics.render().unwrap();
    assert!(output.contains("truenas_up 1"));
    assert!(output.contains("truenas_connection_state{state=\"connected\"} 1"));
    assert!(output.contains("truenas_connection_state{state=\"disconnected\"} 0"));
    assert!(output.contains("truenas_connection_transitions_total{state=\"connected\"} 1"));

    metrics.record_transition(&StateChange {
        from: ConnectionState::Connected,
        to: ConnectionState::Reconnecting,
        error: Some("connection closed by server".to_string()),
        retry_in: Some(Duration::from_secs(1)),
    });

    let output = metrics.render().unwrap();
    assert!(output.contains("truenas_up 0"));
    assert!(output.contains("truenas_connection_state{state=\"reconnecting\"} 1"));
    assert!(output.contains("truenas_connection_state{state=\"connected\"} 0"));
}

#[test]
fn test_traffic_counters() {
    let metrics = SessionMetrics::new().expect("Failed to create session metrics");

    metrics.record_call("system.info", "success");
    metrics.record_call("system.info", "success");
    metrics.record_call("system.info", "error");
    metrics.record_notification("alert.list");

    let output = metrics.render().unwrap();
    assert!(output.contains("truenas_calls_total{method=\"system.info\",outcome=\"success\"} 2"));
    assert!(output.contains("truenas_calls_total{method=\"system.info\",outcome=\"error\"} 1"));
    assert!(output.contains("truenas_notifications_total{topic=\"alert.list\"} 1"));
}

#[test]
fn test_system_info_update() {
    let metrics = SessionMetrics::new().expect("Failed to create session metrics");

    let info: SystemInfo = serde_json::from_value(serde_json::json!({
        "version": "TrueNAS-SCALE-24.10.0",
        "hostname": "nas",
        "uptime_seconds": 12345.0,
        "loadavg": [0.5, 0.25, 0.125],
        "physmem": 34359738368u64
    }))
    .unwrap();
    metrics.record_system_info(&info);

    let output = metrics.render().unwrap();
    assert!(output.contains("hostname=\"nas\""));
    assert!(output.contains("truenas_system_uptime_seconds 12345"));
    assert!(output.contains("truenas_system_load_average{period=\"5m\"} 0.25"));
    assert!(output.contains("truenas_system_memory_total_bytes 34359738368"));
}
