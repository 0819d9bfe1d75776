//! **WakeWordEngine** — activation phrase spotting over continuous recognition.
//!
//! Finalized fragments from a continuous recognition session are kept in a
//! small sliding window. The window is normalized and scanned for any wake
//! phrase variant. A match fires at most once per cooldown window, and every
//! match (fired or suppressed) clears the window.

use crate::config::WakeWordConfig;
use crate::error::VoiceError;
use crate::recognition::{
    RecognitionEvent, RecognitionMode, RecognitionOptions, RecognitionSession, SpeechRecognizer,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeWordStatus {
    Disabled,
    Listening,
    Triggered,
    Unsupported,
}

/// A fired wake phrase.
#[derive(Debug, Clone, PartialEq)]
pub struct WakeDetection {
    /// The matched variant, normalized.
    pub phrase: String,
    /// The normalized window that contained it.
    pub transcript: String,
    /// Words spoken after the phrase, if any.
    pub query: Option<String>,
    pub at: Instant,
}

/// Events emitted by the wake-word engine
#[derive(Debug)]
pub enum WakeEvent {
    Detected(WakeDetection),
    StatusChanged(WakeWordStatus),
    /// A fatal recognition error; the engine has disabled itself.
    Error(VoiceError),
}

/// Lowercase, drop apostrophes, turn other punctuation into spaces, collapse whitespace.
pub fn normalize_transcript(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .filter(|c| *c != '\'' && *c != '’')
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Byte offset range of the first whole-word occurrence of `phrase` in `text`.
fn find_phrase(text: &str, phrase: &str) -> Option<(usize, usize)> {
    text.match_indices(phrase).find_map(|(start, _)| {
        let end = start + phrase.len();
        let starts_word = start == 0 || text[..start].ends_with(' ');
        let ends_word = end == text.len() || text[end..].starts_with(' ');
        (starts_word && ends_word).then_some((start, end))
    })
}

pub struct WakeWordEngine {
    config: WakeWordConfig,
    recognizer: Arc<dyn SpeechRecognizer>,
    /// Normalized variants, longest first so "hey ghost quant" wins over shorter overlaps.
    phrases: Vec<String>,
    status: WakeWordStatus,
    enabled: bool,
    session: Option<RecognitionSession>,
    buffer: VecDeque<String>,
    last_trigger: Option<Instant>,
    event_tx: mpsc::UnboundedSender<WakeEvent>,
}

impl WakeWordEngine {
    pub fn new(
        config: WakeWordConfig,
        recognizer: Arc<dyn SpeechRecognizer>,
    ) -> (Self, mpsc::UnboundedReceiver<WakeEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut phrases: Vec<String> = config
            .phrases
            .iter()
            .map(|p| normalize_transcript(p))
            .filter(|p| !p.is_empty())
            .collect();
        phrases.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        phrases.dedup();

        let status = if recognizer.is_supported() {
            WakeWordStatus::Disabled
        } else {
            WakeWordStatus::Unsupported
        };

        let engine = Self {
            config,
            recognizer,
            phrases,
            status,
            enabled: false,
            session: None,
            buffer: VecDeque::new(),
            last_trigger: None,
            event_tx,
        };

        (engine, event_rx)
    }

    pub fn status(&self) -> WakeWordStatus {
        self.status
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Start the continuous recognition session. Returns false when
    /// recognition is unsupported or the session could not be started.
    pub async fn enable(&mut self) -> bool {
        if !self.recognizer.is_supported() {
            self.set_status(WakeWordStatus::Unsupported);
            return false;
        }
        if self.enabled && self.session.is_some() {
            return true;
        }

        self.enabled = true;
        if self.open_session().await {
            info!("👂 wake word listening");
            self.set_status(WakeWordStatus::Listening);
            true
        } else {
            false
        }
    }

    /// Tear down the session and forget buffered text. Idempotent.
    pub fn disable(&mut self) {
        let had_session = self.session.take().is_some();
        self.enabled = false;
        self.buffer.clear();
        if had_session {
            debug!("wake word session closed");
        }
        if self.status != WakeWordStatus::Unsupported {
            self.set_status(WakeWordStatus::Disabled);
        }
    }

    /// Next event from the live session. Pending while none is open.
    pub async fn next_recognition(&mut self) -> RecognitionEvent {
        match self.session.as_mut() {
            Some(session) => session.recv().await,
            None => std::future::pending().await,
        }
    }

    pub async fn handle_recognition(&mut self, event: RecognitionEvent) {
        if !self.enabled {
            return;
        }
        match event {
            RecognitionEvent::Started => debug!("wake recognition started"),
            RecognitionEvent::Result(result) => {
                if result.is_final {
                    self.process_transcript(&result.text, Instant::now());
                }
            }
            RecognitionEvent::Error(kind) if kind.is_transient() => {
                debug!(code = kind.code(), "wake recognition restarting");
                self.restart().await;
            }
            RecognitionEvent::Error(kind) => {
                warn!(code = kind.code(), "wake recognition failed");
                self.disable();
                self.emit(WakeEvent::Error(kind.into_error()));
            }
            RecognitionEvent::Ended => {
                debug!("wake recognition ended, restarting");
                self.restart().await;
            }
        }
    }

    /// Add a finalized fragment to the window and test it for a wake phrase.
    pub fn process_transcript(&mut self, text: &str, now: Instant) -> Option<WakeDetection> {
        let fragment = normalize_transcript(text);
        if fragment.is_empty() {
            return None;
        }
        self.buffer.push_back(fragment);
        while self.buffer.len() > self.config.buffer_size {
            self.buffer.pop_front();
        }

        let window = self.buffer.iter().cloned().collect::<Vec<_>>().join(" ");
        let (phrase, end) = self
            .phrases
            .iter()
            .find_map(|p| find_phrase(&window, p).map(|(_, end)| (p.clone(), end)))?;
        self.buffer.clear();

        if let Some(last) = self.last_trigger {
            if now.saturating_duration_since(last) < self.config.cooldown() {
                debug!(phrase = %phrase, "wake phrase suppressed by cooldown");
                return None;
            }
        }

        self.last_trigger = Some(now);
        let query = Some(window[end..].trim().to_string()).filter(|q| !q.is_empty());
        let detection = WakeDetection {
            phrase,
            transcript: window,
            query,
            at: now,
        };
        info!(phrase = %detection.phrase, query = ?detection.query, "✨ wake word detected");
        self.set_status(WakeWordStatus::Triggered);
        self.emit(WakeEvent::Detected(detection.clone()));
        Some(detection)
    }

    /// Words following the first wake phrase in `text`.
    pub fn extract_query_after_wake_word(&self, text: &str) -> Option<String> {
        let normalized = normalize_transcript(text);
        self.phrases.iter().find_map(|p| {
            find_phrase(&normalized, p)
                .map(|(_, end)| normalized[end..].trim().to_string())
                .filter(|q| !q.is_empty())
        })
    }

    async fn open_session(&mut self) -> bool {
        let options = RecognitionOptions {
            mode: RecognitionMode::Continuous,
            language: self.config.language.clone(),
            interim_results: true,
            max_alternatives: 1,
        };
        match self.recognizer.start(&options).await {
            Ok(session) => {
                self.session = Some(session);
                true
            }
            Err(e) => {
                warn!("wake recognition could not start: {}", e);
                self.disable();
                self.emit(WakeEvent::Error(e));
                false
            }
        }
    }

    async fn restart(&mut self) {
        self.session = None;
        if self.enabled {
            self.open_session().await;
        }
    }

    fn set_status(&mut self, status: WakeWordStatus) {
        if self.status != status {
            self.status = status;
            self.emit(WakeEvent::StatusChanged(status));
        }
    }

    fn emit(&self, event: WakeEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("wake event dropped: no receiver");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::{RecognitionErrorKind, ScriptedRecognizer};
    use std::time::Duration;

    fn engine(
        recognizer: &ScriptedRecognizer,
    ) -> (WakeWordEngine, mpsc::UnboundedReceiver<WakeEvent>) {
        WakeWordEngine::new(WakeWordConfig::default(), Arc::new(recognizer.clone()))
    }

    #[test]
    fn normalization() {
        assert_eq!(
            normalize_transcript("  Hey,   GhostQuant!  What's Hydra? "),
            "hey ghostquant whats hydra"
        );
    }

    #[test]
    fn query_after_wake_word() {
        let (engine, _rx) = engine(&ScriptedRecognizer::new());
        assert_eq!(
            engine.extract_query_after_wake_word("hey ghostquant what is hydra"),
            Some("what is hydra".to_string())
        );
        assert_eq!(
            engine.extract_query_after_wake_word("Hey Ghost Quant, show me whales."),
            Some("show me whales".to_string())
        );
        assert_eq!(engine.extract_query_after_wake_word("hey ghostquant"), None);
        assert_eq!(engine.extract_query_after_wake_word("hey ghostquantum"), None);
    }

    #[tokio::test]
    async fn phrase_split_across_fragments_is_found() {
        let (mut engine, _rx) = engine(&ScriptedRecognizer::new());
        let now = Instant::now();
        assert!(engine.process_transcript("hey", now).is_none());
        let detection = engine.process_transcript("ghost quant", now).unwrap();
        assert_eq!(detection.phrase, "hey ghost quant");
        assert_eq!(detection.query, None);
    }

    #[tokio::test]
    async fn at_most_one_trigger_per_cooldown() {
        let (mut engine, _rx) = engine(&ScriptedRecognizer::new());
        let start = Instant::now();

        assert!(engine.process_transcript("hey ghostquant", start).is_some());
        assert!(engine
            .process_transcript("hey ghostquant", start + Duration::from_millis(1000))
            .is_none());
        assert!(engine
            .process_transcript("ok ghostquant", start + Duration::from_millis(2900))
            .is_none());
        assert!(engine
            .process_transcript("hey ghostquant", start + Duration::from_millis(3100))
            .is_some());
    }

    #[tokio::test]
    async fn suppressed_match_does_not_fire_later() {
        let (mut engine, _rx) = engine(&ScriptedRecognizer::new());
        let start = Instant::now();
        engine.process_transcript("hey ghostquant", start);
        engine.process_transcript("hey ghostquant", start + Duration::from_millis(500));
        // The suppressed phrase was cleared, so unrelated text cannot re-match it.
        assert!(engine
            .process_transcript("nice weather", start + Duration::from_millis(3500))
            .is_none());
    }

    #[tokio::test]
    async fn buffer_keeps_last_five_fragments() {
        let (mut engine, _rx) = engine(&ScriptedRecognizer::new());
        let now = Instant::now();
        engine.process_transcript("hey", now);
        for word in ["one", "two", "three", "four", "five"] {
            engine.process_transcript(word, now);
        }
        assert_eq!(engine.buffer.len(), 5);
        assert!(!engine.buffer.contains(&"hey".to_string()));
    }

    #[tokio::test]
    async fn transient_errors_restart_the_session() {
        let recognizer = ScriptedRecognizer::new();
        let (mut engine, _rx) = engine(&recognizer);
        assert!(engine.enable().await);
        assert_eq!(engine.status(), WakeWordStatus::Listening);

        engine
            .handle_recognition(RecognitionEvent::Error(RecognitionErrorKind::NoSpeech))
            .await;
        engine.handle_recognition(RecognitionEvent::Ended).await;
        assert!(engine.has_session());
        assert_eq!(recognizer.started_count(RecognitionMode::Continuous), 3);
        assert_eq!(recognizer.max_concurrent_sessions(), 1);
    }

    #[tokio::test]
    async fn fatal_error_disables_and_reports() {
        let recognizer = ScriptedRecognizer::new();
        let (mut engine, mut rx) = engine(&recognizer);
        engine.enable().await;
        engine
            .handle_recognition(RecognitionEvent::Error(RecognitionErrorKind::NotAllowed))
            .await;
        assert!(!engine.is_enabled());
        assert_eq!(recognizer.open_sessions(), 0);
        let last = std::iter::from_fn(|| rx.try_recv().ok()).last();
        assert!(matches!(
            last,
            Some(WakeEvent::Error(VoiceError::PermissionDenied(_)))
        ));
    }

    #[tokio::test]
    async fn unsupported_recognizer() {
        let (mut engine, _rx) = engine(&ScriptedRecognizer::unsupported());
        assert_eq!(engine.status(), WakeWordStatus::Unsupported);
        assert!(!engine.enable().await);
        engine.disable();
        assert_eq!(engine.status(), WakeWordStatus::Unsupported);
    }
}
