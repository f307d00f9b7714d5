//! Process wiring for the event bus consumer.

pub mod handlers;
