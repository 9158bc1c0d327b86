//! UI event bus — the hot `ui$` stream front-end adapters subscribe to.
//!
//! Backed by a tokio broadcast channel: slow consumers lag and lose events,
//! the kernel never blocks or retries on their behalf.

use tokio::sync::broadcast;

use orchard_domain::ui::UiEvent;

const UI_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct UiBus {
    tx: broadcast::Sender<UiEvent>,
}

impl UiBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(UI_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Fire-and-forget emission. "No receivers" is not an error.
    pub fn send(&self, event: UiEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }
}

impl Default for UiBus {
    fn default() -> Self {
        Self::new()
    }
}
