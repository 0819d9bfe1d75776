//! **Streaming Speech-to-Text** — recognition during an active turn.
//!
//! The engine wraps one recognition session per turn and turns its results
//! into [`SttEvent`]s:
//!
//! - every non-final result becomes a `Partial` and is tested for an early
//!   intent (each intent kind at most once per turn),
//! - every final result is appended to the accumulated transcript and arms the
//!   silence timeout,
//! - the turn closes with `SpeechEnd` on the first final (single-turn mode) or
//!   when the silence timeout elapses (continuous mode).
//!
//! Barge-in: [`StreamingSttEngine::on_audio_level`] asks the
//! [`SpeakingFloor`] to interrupt system speech when the user is loud enough.

use crate::config::SttConfig;
use crate::error::VoiceError;
use crate::events::EventBus;
use crate::intent::{detect_leading_intent, IntentKind};
use crate::recognition::{
    RecognitionEvent, RecognitionMode, RecognitionOptions, RecognitionResult, RecognitionSession,
    SpeechRecognizer,
};
use crate::turn::SpeakingFloor;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One recognition hypothesis with its arrival time.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialTranscript {
    pub text: String,
    pub is_final: bool,
    /// 0..1
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

impl From<RecognitionResult> for PartialTranscript {
    fn from(result: RecognitionResult) -> Self {
        Self {
            text: result.text,
            is_final: result.is_final,
            confidence: result.confidence.clamp(0.0, 1.0),
            timestamp: Utc::now(),
        }
    }
}

/// Events emitted by the STT engine
#[derive(Debug)]
pub enum SttEvent {
    Started,
    Partial(PartialTranscript),
    Final(PartialTranscript),
    /// The turn is over; `transcript` is everything finalized during it.
    SpeechEnd { transcript: String },
    EarlyIntent { kind: IntentKind, transcript: String },
    /// System speech was cut off by the user.
    Interrupted,
    Error(VoiceError),
}

pub struct StreamingSttEngine {
    config: SttConfig,
    recognizer: Arc<dyn SpeechRecognizer>,
    floor: Arc<dyn SpeakingFloor>,
    bus: EventBus,
    session: Option<RecognitionSession>,
    listening: bool,
    paused: bool,
    accumulated: String,
    silence_deadline: Option<Instant>,
    intents_fired: HashSet<IntentKind>,
    event_tx: mpsc::UnboundedSender<SttEvent>,
}

impl StreamingSttEngine {
    pub fn new(
        config: SttConfig,
        recognizer: Arc<dyn SpeechRecognizer>,
        floor: Arc<dyn SpeakingFloor>,
        bus: EventBus,
    ) -> (Self, mpsc::UnboundedReceiver<SttEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let engine = Self {
            config,
            recognizer,
            floor,
            bus,
            session: None,
            listening: false,
            paused: false,
            accumulated: String::new(),
            silence_deadline: None,
            intents_fired: HashSet::new(),
            event_tx,
        };

        (engine, event_rx)
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Everything finalized in the current turn. Only ever grows within a turn.
    pub fn accumulated_transcript(&self) -> &str {
        &self.accumulated
    }

    pub fn silence_deadline(&self) -> Option<Instant> {
        self.silence_deadline
    }

    /// Begin a new turn. Returns false if recognition could not start.
    pub async fn start(&mut self) -> bool {
        if !self.recognizer.is_supported() {
            self.emit(SttEvent::Error(VoiceError::RecognitionUnsupported));
            return false;
        }
        if self.listening && self.session.is_some() {
            return true;
        }

        self.accumulated.clear();
        self.intents_fired.clear();
        self.silence_deadline = None;
        self.paused = false;
        self.listening = true;

        if self.open_session().await {
            info!("📝 STT listening");
            self.emit(SttEvent::Started);
            true
        } else {
            false
        }
    }

    /// End the turn without declaring speech end. Idempotent.
    pub fn stop(&mut self) {
        if self.session.take().is_some() {
            debug!("STT session closed");
        }
        self.listening = false;
        self.paused = false;
        self.silence_deadline = None;
    }

    /// Suspend recognition, keeping the transcript so far.
    pub fn pause(&mut self) {
        if !self.listening || self.paused {
            return;
        }
        self.session = None;
        self.paused = true;
        self.silence_deadline = None;
        debug!("STT paused");
    }

    pub async fn resume(&mut self) {
        if !self.listening || !self.paused {
            return;
        }
        self.paused = false;
        if self.open_session().await {
            if !self.accumulated.is_empty() {
                self.silence_deadline = Some(Instant::now() + self.config.silence_timeout());
            }
            debug!("STT resumed");
        }
    }

    /// Pre-load the transcript (the query spoken right after the wake phrase)
    /// and arm the silence timeout as if a final had arrived.
    pub fn seed(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() || !self.listening {
            return;
        }
        self.append_final(text);
        self.silence_deadline = Some(Instant::now() + self.config.silence_timeout());
        debug!(seed = %text, "STT seeded");
    }

    /// Next event from the live session. Pending while none is open.
    pub async fn next_recognition(&mut self) -> RecognitionEvent {
        match self.session.as_mut() {
            Some(session) => session.recv().await,
            None => std::future::pending().await,
        }
    }

    pub async fn handle_recognition(&mut self, event: RecognitionEvent) {
        if !self.listening || self.paused {
            return;
        }
        match event {
            RecognitionEvent::Started => debug!("STT recognition started"),
            RecognitionEvent::Result(result) if result.is_final => self.on_final(result),
            RecognitionEvent::Result(result) => self.on_partial(result),
            RecognitionEvent::Error(kind) if kind.is_transient() => {
                debug!(code = kind.code(), "STT restarting");
                self.restart().await;
            }
            RecognitionEvent::Error(kind) => {
                warn!(code = kind.code(), "STT failed");
                self.stop();
                self.emit(SttEvent::Error(kind.into_error()));
            }
            RecognitionEvent::Ended => {
                debug!("STT session ended, restarting");
                self.restart().await;
            }
        }
    }

    fn on_partial(&mut self, result: RecognitionResult) {
        let partial = PartialTranscript::from(result);
        if let Some(kind) = detect_leading_intent(&partial.text) {
            if self.intents_fired.insert(kind) {
                debug!(intent = %kind, "early intent");
                self.bus.publish(kind, partial.text.clone());
                self.emit(SttEvent::EarlyIntent {
                    kind,
                    transcript: partial.text.clone(),
                });
            }
        }
        self.emit(SttEvent::Partial(partial));
    }

    fn on_final(&mut self, result: RecognitionResult) {
        let transcript = PartialTranscript::from(result);
        let text = transcript.text.trim().to_string();
        if !text.is_empty() {
            self.append_final(&text);
        }
        self.silence_deadline = Some(Instant::now() + self.config.silence_timeout());
        self.emit(SttEvent::Final(transcript));

        if self.config.single_turn {
            self.end_speech();
        }
    }

    fn append_final(&mut self, text: &str) {
        if !self.accumulated.is_empty() {
            self.accumulated.push(' ');
        }
        self.accumulated.push_str(text);
    }

    /// Fire speech end if the silence deadline has passed.
    pub fn on_silence_timeout(&mut self, now: Instant) {
        match self.silence_deadline {
            Some(deadline) if now >= deadline => {
                debug!("STT silence timeout");
                self.end_speech();
            }
            _ => {}
        }
    }

    /// Close the turn now with whatever was finalized.
    pub fn end_speech(&mut self) {
        if !self.listening {
            return;
        }
        let transcript = self.accumulated.clone();
        self.stop();
        info!(transcript = %transcript, "🎯 speech end");
        self.emit(SttEvent::SpeechEnd { transcript });
    }

    /// Barge-in check. Returns true when this level interrupted system speech.
    pub fn on_audio_level(&mut self, level: f32) -> bool {
        if level <= self.config.interrupt_level() || !self.floor.is_system_speaking() {
            return false;
        }
        if self.floor.request_interrupt() {
            self.emit(SttEvent::Interrupted);
            return true;
        }
        false
    }

    fn options(&self) -> RecognitionOptions {
        RecognitionOptions {
            mode: if self.config.single_turn {
                RecognitionMode::SingleTurn
            } else {
                RecognitionMode::Continuous
            },
            language: self.config.language.clone(),
            interim_results: self.config.interim_results,
            max_alternatives: self.config.max_alternatives,
        }
    }

    async fn open_session(&mut self) -> bool {
        match self.recognizer.start(&self.options()).await {
            Ok(session) => {
                self.session = Some(session);
                true
            }
            Err(e) => {
                warn!("STT could not start: {}", e);
                self.stop();
                self.emit(SttEvent::Error(e));
                false
            }
        }
    }

    async fn restart(&mut self) {
        self.session = None;
        if self.listening && !self.paused {
            self.open_session().await;
        }
    }

    fn emit(&self, event: SttEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("STT event dropped: no receiver");
        }
    }
}
