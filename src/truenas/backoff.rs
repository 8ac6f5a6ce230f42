//! Reconnect backoff
//!
//! Exponential delay between reconnect attempts: `initial * factor^attempt`, capped at
//! `max`, with optional jitter of up to 25%. The attempt counter only goes back to zero
//! through [`ExponentialBackoff::reset`], which the connection worker calls once a
//! connection has stayed up for the stabilization window.

use crate::config::SessionConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: bool,
    max_retries: Option<u32>,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            factor: 2.0,
            jitter: false,
            max_retries: None,
            attempt: 0,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        let mut backoff = Self::new(
            Duration::from_millis(config.initial_retry_delay_ms),
            Duration::from_secs(config.max_retry_delay_secs),
        )
        .with_factor(config.backoff_factor);
        backoff.jitter = config.retry_jitter;
        backoff.max_retries = config.max_retries;
        backoff
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Delay before the next attempt, or `None` once retries are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_retries {
            if self.attempt >= max {
                return None;
            }
        }

        let mut delay = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter {
            let spread = delay.as_millis() as u64 / 4;
            let extra = rand::thread_rng().gen_range(0..=spread);
            delay = (delay + Duration::from_millis(extra)).min(self.max);
        }

        Some(delay)
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.factor.powi(exponent);
        // `min` also maps an overflowed (infinite) product onto the ceiling.
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
