//! Lifecycle notifications for a loaded extension.

use std::path::PathBuf;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use orbit_core::InstanceId;
use parking_lot::Mutex;

/// Events emitted by an [`ExtensionProcess`](crate::ExtensionProcess).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionEvent {
    /// The extension was replaced by a new build and every surviving
    /// instance was re-attached.
    Reloaded {
        /// Path of the watched binary.
        path: PathBuf,
        /// Content hash of the new build.
        hash: String,
    },
    /// The child process exited on its own; a restart follows.
    ProcessExited {
        /// Path of the watched binary.
        path: PathBuf,
    },
    /// A reload attempt failed and will be retried.
    ReloadFailed {
        /// Path of the watched binary.
        path: PathBuf,
        /// Why it failed.
        reason: String,
    },
    /// A reload changed or removed functions this instance was bound
    /// against, so it was closed.
    InstanceInvalidated {
        /// The instance.
        instance: InstanceId,
        /// The functions whose signature drifted.
        functions: Vec<String>,
    },
}

impl ExtensionEvent {
    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            ExtensionEvent::Reloaded { .. } => "reloaded",
            ExtensionEvent::ProcessExited { .. } => "process_exited",
            ExtensionEvent::ReloadFailed { .. } => "reload_failed",
            ExtensionEvent::InstanceInvalidated { .. } => "instance_invalidated",
        }
    }
}

/// Fan-out of events to bounded subscriber channels.
///
/// Emitting never blocks: a subscriber whose channel is full misses the
/// event, and one that has dropped its receiver is forgotten.
pub struct EventChannel {
    subscribers: Mutex<Vec<Sender<ExtensionEvent>>>,
    capacity: usize,
}

impl EventChannel {
    /// Create a channel whose subscriptions buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Add a subscriber.
    pub fn subscribe(&self) -> Receiver<ExtensionEvent> {
        let (tx, rx) = bounded(self.capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Get subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver `event` to every subscriber that has room for it.
    pub fn emit(&self, event: ExtensionEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::trace!(event = event.event_type(), "Subscriber not ready, skipped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("subscriber_count", &self.subscriber_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}
