//! Typed session lifecycle events and the subscriber registry

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

/// Lifecycle events emitted by the session orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Session reached Active (START received); media may now flow
    Connected,
    /// Session ended, either by the caller or the remote side
    Disconnected,
    /// Terminal failure with a descriptive reason
    Failed(String),
    /// The avatar started speaking
    Speaking,
    /// The avatar went silent
    Silent,
}

/// Event kind used as the subscription key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    /// `SessionEvent::Connected`
    Connected,
    /// `SessionEvent::Disconnected`
    Disconnected,
    /// `SessionEvent::Failed`
    Failed,
    /// `SessionEvent::Speaking`
    Speaking,
    /// `SessionEvent::Silent`
    Silent,
}

impl SessionEvent {
    /// The subscription kind this event dispatches to
    pub fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::Connected => SessionEventKind::Connected,
            SessionEvent::Disconnected => SessionEventKind::Disconnected,
            SessionEvent::Failed(_) => SessionEventKind::Failed,
            SessionEvent::Speaking => SessionEventKind::Speaking,
            SessionEvent::Silent => SessionEventKind::Silent,
        }
    }
}

/// Callback invoked for a subscribed event
pub type EventHandler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Opaque handle returned by [`EventBus::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// Publish/subscribe surface for session events
///
/// Subscribers are invoked synchronously in registration order. A
/// panicking subscriber is isolated so its siblings still run.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<SessionEventKind, Vec<(HandlerId, EventHandler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to an event kind
    pub fn on<F>(&self, kind: SessionEventKind, handler: F) -> HandlerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Unsubscribe a previously registered handler
    ///
    /// Returns true if the handler was found and removed.
    pub fn off(&self, kind: SessionEventKind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        if let Some(list) = handlers.get_mut(&kind) {
            let before = list.len();
            list.retain(|(hid, _)| *hid != id);
            return list.len() != before;
        }
        false
    }

    /// Dispatch an event to all subscribers of its kind
    pub fn emit(&self, event: &SessionEvent) {
        // Snapshot under the lock so a handler can subscribe/unsubscribe
        // without deadlocking the dispatch.
        let snapshot: Vec<EventHandler> = self
            .handlers
            .lock()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(event = ?event, "event handler panicked");
            }
        }
    }
}
