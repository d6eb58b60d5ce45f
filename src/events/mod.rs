// src/events/mod.rs

//! Lifecycle event delivery
//!
//! Every observable bundle transition produces a [`BundleEvent`]. Events are
//! collected while the runtime lock is held and dispatched to listeners
//! after it is released, so a listener can call back into the runtime
//! without deadlocking.

use crate::bundle::BundleId;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use strum_macros::Display;
use tracing::debug;

/// What happened to a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum BundleEventKind {
    Installed,
    Resolved,
    Starting,
    Started,
    Stopping,
    Stopped,
    Updated,
    Unresolved,
    Uninstalled,
}

/// One lifecycle transition, stamped at the moment it became visible
#[derive(Debug, Clone)]
pub struct BundleEvent {
    pub bundle: BundleId,
    pub kind: BundleEventKind,
    pub at: DateTime<Utc>,
}

impl BundleEvent {
    pub fn new(bundle: BundleId, kind: BundleEventKind) -> Self {
        Self {
            bundle,
            kind,
            at: Utc::now(),
        }
    }
}

impl fmt::Display for BundleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.bundle, self.kind)
    }
}

/// A failure surfaced outside any caller's control flow, such as an
/// activator error during shutdown
#[derive(Debug, Clone)]
pub struct FrameworkError {
    pub bundle: Option<BundleId>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl FrameworkError {
    pub fn new(bundle: Option<BundleId>, message: impl Into<String>) -> Self {
        Self {
            bundle,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Receives lifecycle events and framework errors
///
/// Callbacks run outside the runtime lock, in the order the transitions
/// became visible. Default implementations ignore everything, so a listener
/// overrides only what it cares about.
pub trait EventListener: Send + Sync {
    fn bundle_changed(&self, _event: &BundleEvent) {}

    fn framework_error(&self, _error: &FrameworkError) {}
}

/// Fan-out to registered listeners
#[derive(Default)]
pub struct EventDispatcher {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    pub fn dispatch(&self, events: &[BundleEvent]) {
        for event in events {
            debug!(bundle = %event.bundle, kind = %event.kind, "bundle event");
            for listener in &self.listeners {
                listener.bundle_changed(event);
            }
        }
    }

    pub fn dispatch_error(&self, error: &FrameworkError) {
        debug!(bundle = ?error.bundle, message = %error.message, "framework error");
        for listener in &self.listeners {
            listener.framework_error(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(BundleId, BundleEventKind)>>,
        errors: Mutex<Vec<String>>,
    }

    impl EventListener for Recorder {
        fn bundle_changed(&self, event: &BundleEvent) {
            self.seen.lock().push((event.bundle, event.kind));
        }

        fn framework_error(&self, error: &FrameworkError) {
            self.errors.lock().push(error.message.clone());
        }
    }

    #[test]
    fn test_dispatch_preserves_order() {
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = EventDispatcher::new();
        dispatcher.add_listener(recorder.clone());

        dispatcher.dispatch(&[
            BundleEvent::new(BundleId(1), BundleEventKind::Installed),
            BundleEvent::new(BundleId(1), BundleEventKind::Resolved),
            BundleEvent::new(BundleId(1), BundleEventKind::Started),
        ]);

        let seen = recorder.seen.lock();
        assert_eq!(
            *seen,
            vec![
                (BundleId(1), BundleEventKind::Installed),
                (BundleId(1), BundleEventKind::Resolved),
                (BundleId(1), BundleEventKind::Started),
            ]
        );
    }

    #[test]
    fn test_framework_error_reaches_listeners() {
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = EventDispatcher::new();
        dispatcher.add_listener(recorder.clone());

        dispatcher.dispatch_error(&FrameworkError::new(Some(BundleId(4)), "activator failed"));
        assert_eq!(*recorder.errors.lock(), vec!["activator failed".to_string()]);
    }

    #[test]
    fn test_event_display() {
        let event = BundleEvent::new(BundleId(7), BundleEventKind::Stopping);
        assert_eq!(event.to_string(), "#7 stopping");
    }
}
