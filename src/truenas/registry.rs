//! Request Registry
//!
//! Correlates in-flight calls with their responses. Each registered request owns a
//! oneshot completion slot; the registry removes the entry before completing it, so a
//! request is resolved, expired, or failed exactly once.

use crate::error::{Result, SessionError};
use crate::truenas::types::RequestId;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// Caller side of a registered request
///
/// Resolves with the call outcome. If the registry is dropped without completing the
/// request (worker gone), resolves with [`SessionError::Cancelled`].
#[derive(Debug)]
pub struct PendingCall {
    rx: oneshot::Receiver<Result<Value>>,
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(SessionError::Cancelled)))
    }
}

struct PendingRequest {
    method: String,
    submitted_at: Instant,
    deadline: Instant,
    timeout: Duration,
    slot: oneshot::Sender<Result<Value>>,
}

pub struct RequestRegistry {
    pending: HashMap<RequestId, PendingRequest>,
    next_id: u64,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            next_id: 1,
        }
    }

    /// Allocate the next numeric id, skipping ids a caller fixed and still has in flight
    pub fn next_id(&mut self) -> RequestId {
        loop {
            let id = RequestId::Number(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn register(&mut self, id: RequestId, method: &str, timeout: Duration) -> Result<PendingCall> {
        if self.pending.contains_key(&id) {
            return Err(SessionError::DuplicateId(id));
        }

        let (slot, rx) = oneshot::channel();
        let submitted_at = Instant::now();
        self.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                submitted_at,
                deadline: deadline_after(submitted_at, timeout),
                timeout,
                slot,
            },
        );

        Ok(PendingCall { rx })
    }

    /// Complete a request. Returns false if the id is not outstanding, e.g. the
    /// response arrived after the request already timed out.
    pub fn resolve(&mut self, id: &RequestId, outcome: Result<Value>) -> bool {
        match self.pending.remove(id) {
            Some(request) => {
                debug!(
                    "{} (id {}) completed in {:?}",
                    request.method,
                    id,
                    request.submitted_at.elapsed()
                );
                // The caller may have stopped waiting; nothing to do then.
                let _ = request.slot.send(outcome);
                true
            }
            None => {
                debug!("Dropping response for unknown request id {}", id);
                false
            }
        }
    }

    /// Fail every request whose deadline is at or before `now`
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, request)| request.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(request) = self.pending.remove(id) {
                debug!("{} (id {}) timed out after {:?}", request.method, id, request.timeout);
                let _ = request.slot.send(Err(SessionError::Timeout {
                    method: request.method,
                    timeout: request.timeout,
                }));
            }
        }

        expired.len()
    }

    /// Fail every outstanding request with an error built by `make_error`
    pub fn fail_all<F>(&mut self, make_error: F) -> usize
    where
        F: Fn() -> SessionError,
    {
        let count = self.pending.len();
        for (_, request) in self.pending.drain() {
            let _ = request.slot.send(Err(make_error()));
        }
        count
    }

    /// Earliest deadline among outstanding requests
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|request| request.deadline).min()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// `start + wait`, saturating to roughly 30 years out instead of overflowing
pub(crate) fn deadline_after(start: Instant, wait: Duration) -> Instant {
    start
        .checked_add(wait)
        .unwrap_or_else(|| start + Duration::from_secs(86_400 * 365 * 30))
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}
