//! Reconnect backoff tests

use std::time::Duration;
use truenas_session::config::SessionConfig;
use truenas_session::truenas::backoff::ExponentialBackoff;

fn secs(values: &[u64]) -> Vec<Option<Duration>> {
    values.iter().map(|s| Some(Duration::from_secs(*s))).collect()
}

#[test]
fn test_delays_double_up_to_cap() {
    // Given: 1s initial delay capped at 60s
    let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));

    // When: Taking eight delays
    let delays: Vec<_> = (0..8).map(|_| backoff.next_delay()).collect();

    // Then: They double until they hit the cap
    assert_eq!(delays, secs(&[1, 2, 4, 8, 16, 32, 60, 60]));
}

#[test]
fn test_custom_factor() {
    // Given: A factor of 3
    let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10))
        .with_factor(3.0);

    // When: Taking three delays
    let delays: Vec<_> = (0..3).map(|_| backoff.next_delay().unwrap()).collect();

    // Then: Each is three times the previous
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(300),
            Duration::from_millis(900),
        ]
    );
}

#[test]
fn test_jitter_stays_within_bounds() {
    // Given: A jittered backoff
    let mut backoff =
        ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60)).with_jitter();

    for attempt in 0..10u32 {
        // When: Taking the next delay
        let delay = backoff.next_delay().unwrap();

        // Then: It is between the base and base + 25%, never above the cap
        let base = Duration::from_secs(1u64 << attempt.min(6)).min(Duration::from_secs(60));
        assert!(delay >= base, "attempt {}: {:?} < {:?}", attempt, delay, base);
        assert!(delay <= base + base / 4);
        assert!(delay <= Duration::from_secs(60));
    }
}

#[test]
fn test_max_retries_exhausts() {
    // Given: At most three retries
    let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60))
        .with_max_retries(3);

    // When: Asking for more delays than allowed
    let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();

    // Then: The fourth and later report exhaustion
    assert_eq!(
        delays,
        vec![
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(2)),
            Some(Duration::from_secs(4)),
            None,
            None,
        ]
    );
}

#[test]
fn test_reset_starts_over() {
    // Given: A backoff that has already grown
    let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
    backoff.next_delay();
    backoff.next_delay();
    backoff.next_delay();
    assert_eq!(backoff.attempt(), 3);

    // When: Resetting
    backoff.reset();

    // Then: The next delay is the initial one again
    assert_eq!(backoff.attempt(), 0);
    assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
}

#[test]
fn test_from_config_uses_session_settings() {
    // Given: Session settings with a 500ms start, 5s cap and two retries
    let config = SessionConfig {
        initial_retry_delay_ms: 500,
        max_retry_delay_secs: 5,
        retry_jitter: false,
        max_retries: Some(2),
        ..SessionConfig::default()
    };

    // When: Building the backoff from them
    let mut backoff = ExponentialBackoff::from_config(&config);

    // Then: It follows those settings
    assert_eq!(backoff.next_delay(), Some(Duration::from_millis(500)));
    assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    assert_eq!(backoff.next_delay(), None);
}

#[test]
fn test_huge_attempt_counts_stay_capped() {
    // Given: A backoff driven far past the cap
    let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));

    // When: Taking two thousand delays
    let last = (0..2000).filter_map(|_| backoff.next_delay()).last();

    // Then: The product overflowing to infinity still lands on the cap
    assert_eq!(last, Some(Duration::from_secs(60)));
}
