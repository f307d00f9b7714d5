//! `finstream-core`: shared building blocks for the event stream consumer.
//!
//! This crate contains **pure** primitives (no broker or storage concerns).

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CoreError;
pub use id::{EntryId, EventId};
