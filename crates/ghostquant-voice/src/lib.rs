//! # GhostQuant Voice - Hands-free voice interaction pipeline
//!
//! This crate turns a live microphone into conversational turns: it spots the
//! wake phrase, streams recognition while the user talks, picks a tone for the
//! reply, speaks it, and lets the user barge in at any moment.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        VoicePipeline                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐     │
//! │  │  MicEngine   │  │  WakeWord    │→ │ StreamingStt     │     │
//! │  │ (FFT volume) │  │ (5-fragment) │  │ (partials/finals)│     │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘     │
//! │         │ level                               ↓ transcript    │
//! │         ↓                            ┌──────────────────┐     │
//! │  ┌──────────────┐   interrupt        │ ToneEngine +     │     │
//! │  │ TurnTaking   │←───────────────────│ ResponseGenerator│     │
//! │  │  (floor)     │──── cancel ──┐     └──────────────────┘     │
//! │  └──────────────┘              ↓              ↓               │
//! │                        ┌────────────────────────────┐         │
//! │                        │   SpeechSynthesizer        │         │
//! │                        └────────────────────────────┘         │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Platform access sits behind four capability traits ([`AudioCapture`],
//! [`SpeechRecognizer`], [`SpeechSynthesizer`], [`PreferenceStore`]). Scripted
//! implementations drive the pipeline deterministically; the `device` feature
//! adds CPAL capture and rodio playback.

pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod hands_free;
pub mod intent;
pub mod mic;
pub mod orchestrator;
pub mod preferences;
pub mod recognition;
pub mod responder;
pub mod stt;
pub mod synthesis;
pub mod tone;
pub mod turn;
pub mod volume;
pub mod wake_word;

pub use capture::{
    AudioCapture, AudioFrame, AudioStream, CaptureConstraints, MicPermissionStatus,
    ScriptedCapture, StreamInfo,
};
#[cfg(feature = "device")]
pub use capture::CpalCapture;
pub use config::VoiceConfig;
pub use error::{VoiceError, VoiceResult};
pub use events::{EventBus, IntentEvent};
pub use hands_free::{Clock, HandsFreeModeManager, HandsFreeModeState, ManualClock, SystemClock};
pub use intent::{detect_leading_intent, IntentKind};
pub use mic::{MicEngine, MicEvent, MicState};
pub use orchestrator::{
    default_pipeline, install_default, teardown_default, PipelineCommand, PipelineDeps,
    PipelineEvent, PipelineHandle, PipelineState, VoicePipeline,
};
pub use preferences::{MemoryPreferenceStore, PreferenceStore, SledPreferenceStore};
pub use recognition::{
    RecognitionErrorKind, RecognitionEvent, RecognitionMode, RecognitionOptions,
    RecognitionResult, RecognitionSession, ScriptedRecognizer, SpeechRecognizer,
};
pub use responder::{CannedResponder, ResponseGenerator};
pub use stt::{PartialTranscript, StreamingSttEngine, SttEvent};
pub use synthesis::{
    OpenAiTts, PlaceholderSynthesizer, PlaceholderTts, SpeechSynthesizer, SynthesisEvent,
    SynthesisSession, TtsBackend,
};
#[cfg(feature = "device")]
pub use synthesis::RodioSynthesizer;
pub use tone::{
    analyze_sentiment, profile_for, ConversationContext, Sentiment, ToneEngine, ToneProfile,
    ToneSelection, ToneType,
};
pub use turn::{Speaker, SpeakingFloor, TurnEvent, TurnTakingManager};
pub use volume::{SilenceTracker, VolumeAnalyzer};
pub use wake_word::{WakeDetection, WakeEvent, WakeWordEngine, WakeWordStatus};
