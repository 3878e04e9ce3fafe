//! Fan-out of dependency events to subscribers outside the controllers.

use api_types::DependencyEvent;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 1024;

/// Cheap to clone; every clone feeds the same subscribers.
#[derive(Clone)]
pub struct Publisher {
    sender: broadcast::Sender<DependencyEvent>,
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Publisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DependencyEvent> {
        self.sender.subscribe()
    }

    /// Fire and forget: an event nobody listens to is dropped.
    pub fn emit(&self, event: DependencyEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            trace!(
                event_type = %event.event_type,
                name = %event.name,
                "No subscriber for dependency event"
            );
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
