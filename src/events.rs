//! Diagnostic events emitted by node functions.
//!
//! Functions emit events through their [`Environment`](crate::Environment). The events
//! are buffered per invocation, dropped when the function restarts, and handed to the
//! build's [`EventHandler`] once the node commits.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Severity of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    /// Progress report.
    Progress,
    /// Informational message.
    Info,
    /// Something the user should look at.
    Warning,
    /// An error the user should look at.
    Error,
}

/// A diagnostic message, tagged with the origin of the node that emitted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Severity.
    pub kind: EventKind,
    /// Message text.
    pub message: String,
    /// Origin tag, from [`NodeFunction::extract_tag`](crate::NodeFunction::extract_tag).
    pub tag: Option<String>,
}

impl Event {
    /// Create an event.
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            tag: None,
        }
    }

    /// Create an info event.
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(EventKind::Info, message)
    }

    /// Create a warning event.
    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(EventKind::Warning, message)
    }

    /// Create an error event.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, message)
    }

    /// Create a progress event.
    pub fn progress(message: impl Into<String>) -> Self {
        Self::new(EventKind::Progress, message)
    }

    /// Attach an origin tag unless one is already set.
    pub fn tagged(mut self, tag: Option<String>) -> Self {
        if self.tag.is_none() {
            self.tag = tag;
        }
        self
    }
}

/// Receiver of committed events.
pub trait EventHandler: Send + Sync + 'static {
    /// Called once per event of every committed node.
    fn handle(&self, event: &Event);
}

/// Forwards events to the `tracing` crate. This is the default handler.
pub struct LoggingEventHandler;

impl EventHandler for LoggingEventHandler {
    fn handle(&self, event: &Event) {
        let tag = event.tag.as_deref().unwrap_or("");
        match event.kind {
            EventKind::Progress => tracing::debug!(tag, "{}", event.message),
            EventKind::Info => tracing::info!(tag, "{}", event.message),
            EventKind::Warning => tracing::warn!(tag, "{}", event.message),
            EventKind::Error => tracing::error!(tag, "{}", event.message),
        }
    }
}

/// Collects events in memory.
///
/// Useful for tests and for callers that want to replay diagnostics after a build.
#[derive(Default)]
pub struct StoredEventHandler {
    events: Mutex<Vec<Event>>,
}

impl StoredEventHandler {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events received so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Events of one kind.
    pub fn of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Returns true if an error event was received.
    pub fn has_errors(&self) -> bool {
        self.events.lock().iter().any(|e| e.kind == EventKind::Error)
    }

    /// Remove and return all events.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Clear all events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventHandler for StoredEventHandler {
    fn handle(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

impl<T: EventHandler> EventHandler for std::sync::Arc<T> {
    fn handle(&self, event: &Event) {
        (**self).handle(event)
    }
}
