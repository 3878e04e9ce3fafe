use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use api_types::NotifySpec;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::domain::PodGroupEngine;
use crate::infrastructure::publisher::Publisher;

/// Application dependencies - simple struct with Arc-wrapped services
pub struct ApplicationServices {
    pub engine: Arc<PodGroupEngine>,
    pub publisher: Publisher,
    /// Taken by the notification task when it starts
    notifications: Mutex<Option<UnboundedReceiver<NotifySpec>>>,
}

impl ApplicationServices {
    pub fn new(
        engine: Arc<PodGroupEngine>,
        publisher: Publisher,
        notifications: UnboundedReceiver<NotifySpec>,
    ) -> Self {
        Self {
            engine,
            publisher,
            notifications: Mutex::new(Some(notifications)),
        }
    }

    pub fn take_notifications(&self) -> Option<UnboundedReceiver<NotifySpec>> {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
