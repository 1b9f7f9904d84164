//! Intra-process broadcast of state-change and metrics events.
//!
//! The core publishes; UI-facing collaborators subscribe. Delivery is lossy
//! for slow subscribers (broadcast semantics), which is fine for display
//! purposes; the authoritative state lives in the processes themselves.

use crate::metrics::TokenMetrics;
use crate::process::ProcessState;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum Event {
    ProcessStateChanged {
        model: String,
        state: ProcessState,
    },
    TokenMetrics(TokenMetrics),
    ConfigReloaded,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(64)
    }
}
