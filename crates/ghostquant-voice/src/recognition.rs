//! Speech-recognition capability.
//!
//! A recognizer is started either in continuous mode (wake-word buffering) or
//! in single-turn mode (conversation) and reports results through a
//! [`RecognitionSession`]. Dropping or aborting the session ends it; events
//! from an aborted session are never observed.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

/// How the recognizer should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionMode {
    /// Keeps running across utterances (wake-word loop).
    Continuous,
    /// One conversational turn.
    SingleTurn,
}

/// Options passed to [`SpeechRecognizer::start`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionOptions {
    pub mode: RecognitionMode,
    pub language: String,
    pub interim_results: bool,
    pub max_alternatives: u8,
}

/// Error codes a recognition session may report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    NoSpeech,
    Aborted,
    AudioCapture,
    NotAllowed,
    Network,
    LanguageNotSupported,
    Other(String),
}

impl RecognitionErrorKind {
    /// `no-speech` and `aborted` are recovered by restarting the session.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NoSpeech | Self::Aborted)
    }

    /// Parse a platform error code such as `"no-speech"`.
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "no-speech" => Self::NoSpeech,
            "aborted" => Self::Aborted,
            "audio-capture" => Self::AudioCapture,
            "not-allowed" | "service-not-allowed" => Self::NotAllowed,
            "network" => Self::Network,
            "language-not-supported" => Self::LanguageNotSupported,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::NoSpeech => "no-speech",
            Self::Aborted => "aborted",
            Self::AudioCapture => "audio-capture",
            Self::NotAllowed => "not-allowed",
            Self::Network => "network",
            Self::LanguageNotSupported => "language-not-supported",
            Self::Other(code) => code.as_str(),
        }
    }

    /// Convert a fatal kind into the error surfaced to the orchestrator.
    pub fn into_error(self) -> VoiceError {
        match self {
            Self::NotAllowed => {
                VoiceError::PermissionDenied("speech recognition not allowed".to_string())
            }
            Self::AudioCapture => {
                VoiceError::Capture("recognizer could not capture audio".to_string())
            }
            other => VoiceError::Recognition(other.code().to_string()),
        }
    }
}

/// One recognition hypothesis.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    pub text: String,
    pub is_final: bool,
    /// 0..1
    pub confidence: f32,
}

/// Events emitted by a recognition session, in platform order.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    Started,
    Result(RecognitionResult),
    Error(RecognitionErrorKind),
    Ended,
}

type AbortFn = Box<dyn FnOnce() + Send>;

/// A running recognition session.
pub struct RecognitionSession {
    id: u64,
    mode: RecognitionMode,
    events: mpsc::UnboundedReceiver<RecognitionEvent>,
    abort: Option<AbortFn>,
}

impl RecognitionSession {
    pub fn new(
        id: u64,
        mode: RecognitionMode,
        events: mpsc::UnboundedReceiver<RecognitionEvent>,
        abort: Option<AbortFn>,
    ) -> Self {
        Self {
            id,
            mode,
            events,
            abort,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> RecognitionMode {
        self.mode
    }

    /// Next event. A closed channel reads as `Ended`.
    pub async fn recv(&mut self) -> RecognitionEvent {
        self.events.recv().await.unwrap_or(RecognitionEvent::Ended)
    }

    /// Stop the platform session. Idempotent.
    pub fn abort(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort();
        }
        self.events.close();
    }
}

impl Drop for RecognitionSession {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Speech-recognition capability.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Whether the platform offers recognition at all.
    fn is_supported(&self) -> bool;

    /// Start a session.
    async fn start(&self, options: &RecognitionOptions) -> VoiceResult<RecognitionSession>;
}

struct LiveSession {
    id: u64,
    mode: RecognitionMode,
    tx: mpsc::UnboundedSender<RecognitionEvent>,
}

struct ScriptedRecognizerState {
    supported: bool,
    start_failure: Option<String>,
    next_id: u64,
    live: Vec<LiveSession>,
    started: Vec<RecognitionOptions>,
    max_concurrent: usize,
}

impl Default for ScriptedRecognizerState {
    fn default() -> Self {
        Self {
            supported: true,
            start_failure: None,
            next_id: 0,
            live: Vec::new(),
            started: Vec::new(),
            max_concurrent: 0,
        }
    }
}

/// Recognizer whose results are injected by the caller.
///
/// Clones share state; tests keep one clone to emit results into whichever
/// session of a given mode is live.
#[derive(Clone, Default)]
pub struct ScriptedRecognizer {
    state: Arc<Mutex<ScriptedRecognizerState>>,
}

impl ScriptedRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A recognizer that reports no platform support.
    pub fn unsupported() -> Self {
        let r = Self::default();
        r.lock().supported = false;
        r
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedRecognizerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `start` call fail.
    pub fn fail_next_start(&self, message: impl Into<String>) {
        self.lock().start_failure = Some(message.into());
    }

    /// Send an event to the live session of `mode`. Returns false if none is live.
    pub fn emit(&self, mode: RecognitionMode, event: RecognitionEvent) -> bool {
        let s = self.lock();
        let sent = match s.live.iter().rev().find(|l| l.mode == mode) {
            Some(live) => live.tx.send(event).is_ok(),
            None => false,
        };
        sent
    }

    pub fn partial(&self, mode: RecognitionMode, text: &str) -> bool {
        self.emit(
            mode,
            RecognitionEvent::Result(RecognitionResult {
                text: text.to_string(),
                is_final: false,
                confidence: 0.6,
            }),
        )
    }

    pub fn final_result(&self, mode: RecognitionMode, text: &str) -> bool {
        self.emit(
            mode,
            RecognitionEvent::Result(RecognitionResult {
                text: text.to_string(),
                is_final: true,
                confidence: 0.92,
            }),
        )
    }

    pub fn error(&self, mode: RecognitionMode, kind: RecognitionErrorKind) -> bool {
        self.emit(mode, RecognitionEvent::Error(kind))
    }

    /// Sessions currently holding the microphone.
    pub fn open_sessions(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_open(&self, mode: RecognitionMode) -> bool {
        self.lock().live.iter().any(|l| l.mode == mode)
    }

    /// Highest number of simultaneously live sessions ever observed.
    pub fn max_concurrent_sessions(&self) -> usize {
        self.lock().max_concurrent
    }

    /// How many sessions of `mode` were started.
    pub fn started_count(&self, mode: RecognitionMode) -> usize {
        self.lock().started.iter().filter(|o| o.mode == mode).count()
    }

    pub fn last_options(&self) -> Option<RecognitionOptions> {
        self.lock().started.last().cloned()
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    fn is_supported(&self) -> bool {
        self.lock().supported
    }

    async fn start(&self, options: &RecognitionOptions) -> VoiceResult<RecognitionSession> {
        let mut s = self.lock();
        if !s.supported {
            return Err(VoiceError::RecognitionUnsupported);
        }
        if let Some(message) = s.start_failure.take() {
            return Err(VoiceError::Recognition(message));
        }

        s.next_id += 1;
        let id = s.next_id;
        let (tx, rx) = mpsc::unbounded_channel();
        s.live.push(LiveSession {
            id,
            mode: options.mode,
            tx,
        });
        s.started.push(options.clone());
        s.max_concurrent = s.max_concurrent.max(s.live.len());
        debug!(session = id, mode = ?options.mode, "scripted recognition started");

        let state = Arc::clone(&self.state);
        let abort: AbortFn = Box::new(move || {
            let mut s = state.lock().unwrap_or_else(PoisonError::into_inner);
            s.live.retain(|l| l.id != id);
        });

        Ok(RecognitionSession::new(id, options.mode, rx, Some(abort)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(mode: RecognitionMode) -> RecognitionOptions {
        RecognitionOptions {
            mode,
            language: "en-US".to_string(),
            interim_results: true,
            max_alternatives: 1,
        }
    }

    #[test]
    fn transient_kinds() {
        assert!(RecognitionErrorKind::from_code("no-speech").is_transient());
        assert!(RecognitionErrorKind::from_code("aborted").is_transient());
        assert!(!RecognitionErrorKind::from_code("network").is_transient());
        assert_eq!(
            RecognitionErrorKind::from_code("bogus"),
            RecognitionErrorKind::Other("bogus".to_string())
        );
    }

    #[test]
    fn fatal_kinds_map_to_error_taxonomy() {
        assert!(matches!(
            RecognitionErrorKind::NotAllowed.into_error(),
            VoiceError::PermissionDenied(_)
        ));
        assert!(matches!(
            RecognitionErrorKind::Network.into_error(),
            VoiceError::Recognition(_)
        ));
    }

    #[tokio::test]
    async fn aborted_session_stops_receiving() {
        let recognizer = ScriptedRecognizer::new();
        let mut session = recognizer
            .start(&options(RecognitionMode::Continuous))
            .await
            .unwrap();
        assert!(recognizer.final_result(RecognitionMode::Continuous, "hello"));
        assert!(matches!(session.recv().await, RecognitionEvent::Result(_)));

        session.abort();
        assert_eq!(recognizer.open_sessions(), 0);
        assert!(!recognizer.final_result(RecognitionMode::Continuous, "late"));
        assert_eq!(session.recv().await, RecognitionEvent::Ended);
    }

    #[tokio::test]
    async fn unsupported_recognizer_refuses_to_start() {
        let recognizer = ScriptedRecognizer::unsupported();
        assert!(!recognizer.is_supported());
        assert!(recognizer
            .start(&options(RecognitionMode::SingleTurn))
            .await
            .is_err());
    }
}
