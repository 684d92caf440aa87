use tokio::sync::broadcast;

use crate::types::SessionEvent;

/// Broadcast event stream type used by session observers.
pub type EventStream = broadcast::Receiver<SessionEvent>;

/// Fan-out of session events.
#[derive(Clone, Debug)]
pub struct SessionChannels {
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionChannels {
    pub fn new(event_buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        Self { event_tx }
    }

    /// Subscribe to emitted session events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}
