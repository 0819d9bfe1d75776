//! Turn-taking management for conversational flow
//!
//! Tracks who owns the audio channel. The orchestrator moves the floor between
//! the user and the system; the STT engine only sees the narrow
//! [`SpeakingFloor`] capability and uses it to interrupt system speech.

use crate::synthesis::SpeechSynthesizer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Who currently holds the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    None,
    User,
    System,
}

/// Events emitted by the turn-taking manager
#[derive(Debug, Clone)]
pub enum TurnEvent {
    UserTurnStarted {
        timestamp: DateTime<Utc>,
    },

    UserTurnEnded {
        timestamp: DateTime<Utc>,
        duration: Duration,
    },

    SystemTurnStarted {
        timestamp: DateTime<Utc>,
    },

    SystemTurnEnded {
        timestamp: DateTime<Utc>,
        duration: Duration,
    },

    /// User interrupted system speech; playback has already been cancelled.
    Interruption {
        timestamp: DateTime<Utc>,
    },
}

/// The part of the turn-taking manager the STT engine is allowed to use.
pub trait SpeakingFloor: Send + Sync {
    fn is_system_speaking(&self) -> bool;

    /// Stop system speech and hand the floor to the user.
    /// Returns false when the system was not speaking.
    fn request_interrupt(&self) -> bool;
}

struct Floor {
    speaker: Speaker,
    since: Option<Instant>,
}

/// Single source of truth for who is speaking.
pub struct TurnTakingManager {
    floor: Mutex<Floor>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    event_tx: mpsc::UnboundedSender<TurnEvent>,
}

impl TurnTakingManager {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TurnEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            floor: Mutex::new(Floor {
                speaker: Speaker::None,
                since: None,
            }),
            synthesizer,
            event_tx,
        });

        (manager, event_rx)
    }

    fn lock(&self) -> MutexGuard<'_, Floor> {
        self.floor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn speaker(&self) -> Speaker {
        self.lock().speaker
    }

    pub fn begin_user_turn(&self) {
        let mut floor = self.lock();
        if floor.speaker == Speaker::User {
            return;
        }
        self.close_turn(&mut floor);
        floor.speaker = Speaker::User;
        floor.since = Some(Instant::now());
        debug!("🎤 user turn started");
        self.emit(TurnEvent::UserTurnStarted {
            timestamp: Utc::now(),
        });
    }

    pub fn end_user_turn(&self) {
        let mut floor = self.lock();
        if floor.speaker == Speaker::User {
            self.close_turn(&mut floor);
        }
    }

    pub fn begin_system_turn(&self) {
        let mut floor = self.lock();
        if floor.speaker == Speaker::System {
            return;
        }
        self.close_turn(&mut floor);
        floor.speaker = Speaker::System;
        floor.since = Some(Instant::now());
        debug!("🔊 system turn started");
        self.emit(TurnEvent::SystemTurnStarted {
            timestamp: Utc::now(),
        });
    }

    pub fn end_system_turn(&self) {
        let mut floor = self.lock();
        if floor.speaker == Speaker::System {
            self.close_turn(&mut floor);
        }
    }

    /// Release the floor without emitting interruption.
    pub fn reset(&self) {
        let mut floor = self.lock();
        self.close_turn(&mut floor);
    }

    fn close_turn(&self, floor: &mut Floor) {
        let duration = floor
            .since
            .take()
            .map(|since| since.elapsed())
            .unwrap_or_default();
        let timestamp = Utc::now();
        match std::mem::replace(&mut floor.speaker, Speaker::None) {
            Speaker::User => self.emit(TurnEvent::UserTurnEnded {
                timestamp,
                duration,
            }),
            Speaker::System => self.emit(TurnEvent::SystemTurnEnded {
                timestamp,
                duration,
            }),
            Speaker::None => {}
        }
    }

    fn emit(&self, event: TurnEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("turn event dropped: no receiver");
        }
    }
}

impl SpeakingFloor for TurnTakingManager {
    fn is_system_speaking(&self) -> bool {
        self.speaker() == Speaker::System
    }

    fn request_interrupt(&self) -> bool {
        let mut floor = self.lock();
        if floor.speaker != Speaker::System {
            return false;
        }

        info!("⚡ Interruption: user speaking, silencing output");
        self.synthesizer.cancel();
        self.close_turn(&mut floor);
        self.emit(TurnEvent::Interruption {
            timestamp: Utc::now(),
        });

        floor.speaker = Speaker::User;
        floor.since = Some(Instant::now());
        self.emit(TurnEvent::UserTurnStarted {
            timestamp: Utc::now(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::PlaceholderSynthesizer;
    use crate::tone::ToneProfile;

    #[test]
    fn floor_moves_between_speakers() {
        let synth = PlaceholderSynthesizer::new();
        let (manager, mut rx) = TurnTakingManager::new(Arc::new(synth));

        manager.begin_user_turn();
        assert_eq!(manager.speaker(), Speaker::User);
        manager.begin_system_turn();
        assert!(manager.is_system_speaking());
        manager.end_system_turn();
        assert_eq!(manager.speaker(), Speaker::None);

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(matches!(events[0], TurnEvent::UserTurnStarted { .. }));
        assert!(matches!(events[1], TurnEvent::UserTurnEnded { .. }));
        assert!(matches!(events[2], TurnEvent::SystemTurnStarted { .. }));
        assert!(matches!(events[3], TurnEvent::SystemTurnEnded { .. }));
    }

    #[tokio::test]
    async fn interrupt_cancels_playback_and_yields_to_user() {
        let synth = PlaceholderSynthesizer::new();
        let (manager, mut rx) = TurnTakingManager::new(Arc::new(synth.clone()));

        assert!(!manager.request_interrupt());

        let _session = synth.speak("answer", &ToneProfile::default()).await.unwrap();
        manager.begin_system_turn();
        assert!(manager.request_interrupt());
        assert!(!synth.is_playing());
        assert_eq!(synth.cancelled_count(), 1);
        assert_eq!(manager.speaker(), Speaker::User);

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, TurnEvent::Interruption { .. })));
        assert!(matches!(events.last(), Some(TurnEvent::UserTurnStarted { .. })));
    }
}
