//! Business handlers for the Finbot event types this process consumes.
//!
//! The handlers only log; the domain modules that own the side effects
//! subscribe by replacing these registrations.

use finstream_events::{Event, HandlerError, HandlerRegistry};
use tracing::info;

/// Event types whose successful handling is pushed to real-time clients.
pub const NOTIFYING_TYPES: &[&str] = &[
    "finbot.transaction.created",
    "finbot.transaction.updated",
    "finbot.budget.updated",
];

/// Event types handled without a real-time push.
pub const QUIET_TYPES: &[&str] = &["finbot.account.created"];

pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for event_type in NOTIFYING_TYPES {
        registry.register_notifying(*event_type, log_event);
    }
    for event_type in QUIET_TYPES {
        registry.register(*event_type, log_event);
    }
    registry
}

fn log_event(event: &Event) -> Result<(), HandlerError> {
    if event.data().is_empty() {
        return Err(HandlerError::failed("event carries no data"));
    }
    info!(
        event_id = %event.id(),
        event_type = %event.event_type(),
        source = %event.source(),
        fields = event.data().len(),
        "handled event"
    );
    Ok(())
}
