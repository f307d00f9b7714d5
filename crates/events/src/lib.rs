//! Events as they travel over the stream: the signed business [`Event`], the
//! broker-level [`LogEntry`] carrying it, the codec between the two, and the
//! registry routing decoded events to business handlers.

pub mod bus;
pub mod codec;
pub mod entry;
pub mod event;
pub mod handler;
pub mod notify;

pub use bus::Subscription;
pub use codec::{DecodeError, EncodeError, EventCodec};
pub use entry::{EVENT_FIELD, LogEntry};
pub use event::{DEFAULT_EVENT_VERSION, Event, EventDraft};
pub use handler::{Dispatched, EventHandlerFn, HandlerError, HandlerRegistry};
pub use notify::{ChannelNotifier, NoopNotifier, NotifyError, RealtimeNotifier};
