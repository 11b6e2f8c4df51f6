// ABOUTME: Named status events for local indicators (LEDs, buzzers) to subscribe to.
// ABOUTME: Emitted by the supervisor, delivery loop and router over a tokio broadcast channel.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::record::RecordKey;

/// A status change an indicator subsystem may react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum StatusEvent {
    Connecting { attempt: u32 },
    Connected,
    PublishOk { key: RecordKey },
    PublishFail { key: RecordKey },
    CommandReceived { topic: String },
}

impl StatusEvent {
    /// Stable event name, e.g. `publish-ok`.
    pub fn name(&self) -> &'static str {
        match self {
            StatusEvent::Connecting { .. } => "connecting",
            StatusEvent::Connected => "connected",
            StatusEvent::PublishOk { .. } => "publish-ok",
            StatusEvent::PublishFail { .. } => "publish-fail",
            StatusEvent::CommandReceived { .. } => "command-received",
        }
    }
}

/// Fan-out of status events. Emitting never blocks and never fails; events
/// are simply dropped when nobody listens.
#[derive(Debug, Clone)]
pub struct StatusEvents {
    tx: broadcast::Sender<StatusEvent>,
}

impl Default for StatusEvents {
    fn default() -> Self {
        Self::new(64)
    }
}

impl StatusEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: StatusEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}
