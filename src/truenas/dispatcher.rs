//! Subscription Dispatcher
//!
//! Routes server notifications to the handlers registered for their topic. Handlers run
//! in registration order; a handler that returns an error or panics is logged and
//! skipped without affecting the others.

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Notification handler. Returning an error only affects logging.
pub type Handler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Identifies one registered handler
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    topic: String,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Outcome of dispatching one notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Topics {
    handlers: HashMap<String, Vec<(u64, Handler)>>,
    next_id: u64,
}

#[derive(Default)]
pub struct SubscriptionDispatcher {
    inner: Mutex<Topics>,
}

impl SubscriptionDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn topics(&self) -> MutexGuard<'_, Topics> {
        // Handlers never run under the lock, so poisoning cannot leave it half-updated.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler. The flag is true when this is the topic's first handler.
    pub fn subscribe(&self, topic: &str, handler: Handler) -> (SubscriptionHandle, bool) {
        let mut topics = self.topics();
        topics.next_id += 1;
        let id = topics.next_id;

        let handlers = topics.handlers.entry(topic.to_string()).or_default();
        let first = handlers.is_empty();
        handlers.push((id, handler));

        (
            SubscriptionHandle {
                id,
                topic: topic.to_string(),
            },
            first,
        )
    }

    /// Remove a handler. Returns `None` if it was not registered, otherwise whether it
    /// was the topic's last handler.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> Option<bool> {
        let mut topics = self.topics();
        let handlers = topics.handlers.get_mut(&handle.topic)?;
        let position = handlers.iter().position(|(id, _)| *id == handle.id)?;
        handlers.remove(position);

        let last = handlers.is_empty();
        if last {
            topics.handlers.remove(&handle.topic);
        }
        Some(last)
    }

    /// Invoke every handler for `topic` in registration order
    pub fn dispatch(&self, topic: &str, payload: &Value) -> DispatchReport {
        let handlers: Vec<Handler> = match self.topics().handlers.get(topic) {
            Some(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
            // Events for capabilities nobody subscribed to
            None => return DispatchReport::default(),
        };

        let mut report = DispatchReport::default();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    warn!("Handler for {} failed: {:#}", topic, e);
                    report.failed += 1;
                }
                Err(_) => {
                    warn!("Handler for {} panicked", topic);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Topics with at least one handler, sorted
    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics().handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics().handlers.contains_key(topic)
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.topics().handlers.get(topic).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.topics().handlers.clear();
    }
}
