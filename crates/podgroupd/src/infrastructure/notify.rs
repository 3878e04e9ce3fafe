//! Operator notifications.

use api_types::NotifySpec;
use tokio::sync::mpsc;
use tracing::warn;

/// Receives one-shot alerts about individual instances.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, spec: NotifySpec);
}

/// Writes notifications to the log
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, spec: NotifySpec) {
        warn!(
            kind = ?spec.kind,
            namespace = %spec.namespace,
            name = %spec.name,
            instance_no = spec.instance_no,
            timestamp = %spec.timestamp,
            "Pod notification"
        );
    }
}

/// Forwards notifications to a channel consumer.
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<NotifySpec>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NotifySpec>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, spec: NotifySpec) {
        if let Err(mpsc::error::SendError(spec)) = self.sender.send(spec) {
            warn!(
                namespace = %spec.namespace,
                name = %spec.name,
                instance_no = spec.instance_no,
                "Notification consumer gone, dropping notification"
            );
        }
    }
}
