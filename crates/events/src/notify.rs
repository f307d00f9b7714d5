//! Real-time fan-out collaborator ("notify on commit").
//!
//! After a handler succeeds for an event type registered with
//! [`HandlerRegistry::register_notifying`](crate::HandlerRegistry::register_notifying),
//! the consumer passes the event, unchanged, to a [`RealtimeNotifier`]. The
//! WebSocket gateway behind it is outside this workspace.

use std::sync::{Arc, Mutex, mpsc};

use crate::bus::Subscription;
use crate::event::Event;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    /// Internal lock poisoning.
    #[error("notifier lock poisoned")]
    Poisoned,

    #[error("notifier unavailable: {0}")]
    Unavailable(String),
}

/// Receives events whose handling just committed.
///
/// Notification is best-effort: a failure is logged by the consumer and never
/// un-does or retries the already-committed handling.
pub trait RealtimeNotifier: Send + Sync {
    fn notify(&self, event: &Event) -> Result<(), NotifyError>;
}

impl<N> RealtimeNotifier for Arc<N>
where
    N: RealtimeNotifier + ?Sized,
{
    fn notify(&self, event: &Event) -> Result<(), NotifyError> {
        (**self).notify(event)
    }
}

/// Discards notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl RealtimeNotifier for NoopNotifier {
    fn notify(&self, _event: &Event) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// In-process fan-out over std channels.
///
/// - No IO / no async
/// - Best-effort fan-out; dead subscribers are dropped on the next notify
#[derive(Debug, Default)]
pub struct ChannelNotifier {
    subscribers: Mutex<Vec<mpsc::Sender<Event>>>,
}

impl ChannelNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<Event> {
        let (tx, rx) = mpsc::channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive events.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|subs| subs.len()).unwrap_or(0)
    }
}

impl RealtimeNotifier for ChannelNotifier {
    fn notify(&self, event: &Event) -> Result<(), NotifyError> {
        let mut subs = self.subscribers.lock().map_err(|_| NotifyError::Poisoned)?;

        // Drop any dead subscribers while publishing.
        subs.retain(|tx| tx.send(event.clone()).is_ok());

        Ok(())
    }
}
