//! Application event bus for named intents.

use crate::intent::IntentKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

const BUS_CAPACITY: usize = 64;

/// A named intent observed in the user's speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentEvent {
    pub kind: IntentKind,
    pub transcript: String,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast bus shared between the voice engines and the host application.
/// Publishing with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IntentEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IntentEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, kind: IntentKind, transcript: impl Into<String>) {
        let event = IntentEvent {
            kind,
            transcript: transcript.into(),
            timestamp: Utc::now(),
        };
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!(intent = %kind, delivered, "intent published");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_named_intents() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(IntentKind::WakeWord, "hey ghostquant");
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, IntentKind::WakeWord);
        assert_eq!(event.kind.to_string(), "wake_word");
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        EventBus::new().publish(IntentKind::Stop, "stop");
    }
}
