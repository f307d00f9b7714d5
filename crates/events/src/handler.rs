//! Event type → business handler routing.
//!
//! Handlers are business logic injected by the application; this module only
//! decides *which* handler runs. New event types are added with another
//! [`HandlerRegistry::register`] call, never by editing dispatch code.
//!
//! Resolution order for an event type such as `finbot.transaction.created`:
//! 1. exact registration (`finbot.transaction.created`)
//! 2. the longest matching category (`finbot.transaction.*`, then `finbot.*`)
//! 3. the catch-all `*`

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::warn;

use crate::event::Event;

/// Business handler function type.
pub type EventHandlerFn = Box<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;

/// Outcome of a handler invocation that did not succeed.
///
/// All variants are treated the same by the consumer: the entry stays pending
/// and becomes eligible for retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("no handler registered for event type '{0}'")]
    Unhandled(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Result of a successful dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatched {
    /// Whether the matched registration asked for a real-time notification.
    pub notify: bool,
}

struct Registration {
    handler: EventHandlerFn,
    notify: bool,
}

/// Registry of business handlers keyed by event type pattern.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Registration>,
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("patterns", &self.patterns())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an exact type, a `prefix.*` category or `*`.
    ///
    /// Registering the same pattern twice replaces the earlier handler.
    pub fn register<F>(&mut self, pattern: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.insert(pattern.into(), Box::new(handler), false)
    }

    /// Like [`register`](Self::register), and successful handling also
    /// triggers a real-time notification carrying the event.
    pub fn register_notifying<F>(&mut self, pattern: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.insert(pattern.into(), Box::new(handler), true)
    }

    fn insert(&mut self, pattern: String, handler: EventHandlerFn, notify: bool) -> &mut Self {
        if self.handlers.insert(pattern.clone(), Registration { handler, notify }).is_some() {
            warn!(pattern = %pattern, "replacing previously registered event handler");
        }
        self
    }

    /// Registered patterns, sorted.
    pub fn patterns(&self) -> Vec<&str> {
        let mut patterns: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        patterns.sort_unstable();
        patterns
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Whether some registration would handle `event_type`.
    pub fn handles(&self, event_type: &str) -> bool {
        self.resolve(event_type).is_some()
    }

    fn resolve(&self, event_type: &str) -> Option<&Registration> {
        if let Some(reg) = self.handlers.get(event_type) {
            return Some(reg);
        }

        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, reg)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = event_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), reg))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, reg)| reg);
        if category.is_some() {
            return category;
        }

        self.handlers.get("*")
    }

    /// Run the handler registered for the event's type.
    ///
    /// A panicking handler is reported as [`HandlerError::Panicked`] instead of
    /// unwinding into the consumer loop.
    pub fn dispatch(&self, event: &Event) -> Result<Dispatched, HandlerError> {
        let Some(reg) = self.resolve(event.event_type()) else {
            warn!(
                event_type = %event.event_type(),
                event_id = %event.id(),
                "no handler registered for event type"
            );
            return Err(HandlerError::Unhandled(event.event_type().to_string()));
        };

        match catch_unwind(AssertUnwindSafe(|| (reg.handler)(event))) {
            Ok(Ok(())) => Ok(Dispatched { notify: reg.notify }),
            Ok(Err(err)) => Err(err),
            Err(payload) => Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::codec::EventCodec;
    use crate::event::EventDraft;

    fn event(event_type: &str) -> Event {
        EventCodec::new("registry-tests")
            .seal(EventDraft::new(event_type, "finbot", json!({})))
            .unwrap()
    }

    fn tagging(tag: &'static str, seen: Arc<std::sync::Mutex<Vec<&'static str>>>) -> impl Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static {
        move |_| {
            seen.lock().unwrap().push(tag);
            Ok(())
        }
    }

    #[test]
    fn exact_match_wins_over_category_and_wildcard() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry
            .register("*", tagging("wildcard", seen.clone()))
            .register("finbot.*", tagging("category", seen.clone()))
            .register("finbot.transaction.created", tagging("exact", seen.clone()));

        registry.dispatch(&event("finbot.transaction.created")).unwrap();
        registry.dispatch(&event("finbot.budget.updated")).unwrap();
        registry.dispatch(&event("mubot.ingestion.completed")).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["exact", "category", "wildcard"]);
    }

    #[test]
    fn longest_category_wins() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry
            .register("finbot.*", tagging("short", seen.clone()))
            .register("finbot.transaction.*", tagging("long", seen.clone()));

        registry.dispatch(&event("finbot.transaction.updated")).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["long"]);
    }

    #[test]
    fn category_does_not_match_partial_segment() {
        let mut registry = HandlerRegistry::new();
        registry.register("fin.*", |_| Ok(()));
        assert!(!registry.handles("finbot.transaction.created"));
        assert!(registry.handles("fin.transaction.created"));
    }

    #[test]
    fn unknown_type_is_unhandled() {
        let registry = HandlerRegistry::new();
        assert_eq!(
            registry.dispatch(&event("dese.correlation.matched")),
            Err(HandlerError::Unhandled("dese.correlation.matched".to_string()))
        );
    }

    #[test]
    fn handler_error_is_returned() {
        let mut registry = HandlerRegistry::new();
        registry.register("finbot.account.created", |_| Err(HandlerError::failed("ledger offline")));

        assert_eq!(
            registry.dispatch(&event("finbot.account.created")),
            Err(HandlerError::Failed("ledger offline".to_string()))
        );
    }

    #[test]
    fn panicking_handler_is_contained() {
        let mut registry = HandlerRegistry::new();
        registry.register("finbot.account.created", |_| panic!("boom"));

        assert_eq!(
            registry.dispatch(&event("finbot.account.created")),
            Err(HandlerError::Panicked("boom".to_string()))
        );
    }

    #[test]
    fn notify_flag_follows_registration() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry
            .register_notifying("finbot.transaction.created", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .register("finbot.budget.updated", |_| Ok(()));

        assert_eq!(
            registry.dispatch(&event("finbot.transaction.created")),
            Ok(Dispatched { notify: true })
        );
        assert_eq!(
            registry.dispatch(&event("finbot.budget.updated")),
            Ok(Dispatched { notify: false })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
