//! **Speech output** — synthesis capability and the playback kill-switch.
//!
//! [`SpeechSynthesizer::speak`] starts playback and returns a
//! [`SynthesisSession`] that reports `Started`, then `Ended` or `Error`.
//! It may take as long as the audio fetch; callers that must stay responsive
//! run it on its own task.
//! [`SpeechSynthesizer::cancel`] silences output immediately; it is what the
//! turn-taking manager calls when the user barges in.
//!
//! Audio bytes come from a [`TtsBackend`] (OpenAI-compatible HTTP or the
//! placeholder); `RodioSynthesizer` (feature `device`) plays them.

use crate::error::{VoiceError, VoiceResult};
use crate::tone::ToneProfile;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Playback progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisEvent {
    Started,
    Ended,
    Error(String),
}

/// One utterance being played.
pub struct SynthesisSession {
    id: u64,
    events: mpsc::UnboundedReceiver<SynthesisEvent>,
}

impl SynthesisSession {
    pub fn new(id: u64, events: mpsc::UnboundedReceiver<SynthesisEvent>) -> Self {
        Self { id, events }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event. A closed channel (cancelled playback) reads as `Ended`.
    pub async fn recv(&mut self) -> SynthesisEvent {
        self.events.recv().await.unwrap_or(SynthesisEvent::Ended)
    }
}

/// Speech synthesis capability.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Start speaking `text` with the given prosody.
    async fn speak(&self, text: &str, profile: &ToneProfile) -> VoiceResult<SynthesisSession>;

    /// Stop playback immediately and drop anything queued.
    fn cancel(&self);
}

/// Backend that turns text into encoded audio (WAV/MP3).
#[async_trait]
pub trait TtsBackend: Send + Sync {
    /// Synthesize text to audio bytes. An empty vec means nothing to play.
    async fn synthesize(&self, text: &str, profile: &ToneProfile) -> VoiceResult<Vec<u8>>;
}

/// Placeholder TTS: returns empty audio so nothing plays.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderTts;

#[async_trait]
impl TtsBackend for PlaceholderTts {
    async fn synthesize(&self, _text: &str, _profile: &ToneProfile) -> VoiceResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Map a profile's voice style to an OpenAI TTS voice.
fn style_to_voice(style: &str) -> &'static str {
    match style.to_ascii_lowercase().as_str() {
        "warm" => "shimmer",
        "authoritative" => "onyx",
        "soothing" => "alloy",
        "clear" => "nova",
        "confident" => "echo",
        "energetic" => "fable",
        _ => "nova",
    }
}

/// OpenAI-compatible `/audio/speech` backend (OpenAI, OpenRouter, local gateways).
#[derive(Debug, Clone)]
pub struct OpenAiTts {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    pub api_key: String,
    /// tts-1 (fast) or tts-1-hd.
    pub model: String,
    /// Fixed voice. If None, derived from the profile's voice style.
    pub voice_override: Option<String>,
    client: reqwest::Client,
}

impl OpenAiTts {
    /// Build from environment: TTS_API_URL, TTS_API_KEY (or OPENAI_API_KEY), TTS_MODEL, TTS_VOICE.
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("TTS_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("TTS_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                VoiceError::Config("TTS requires TTS_API_KEY or OPENAI_API_KEY".to_string())
            })?;
        let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        let mut tts = Self::new(base_url, api_key, model)?;
        tts.voice_override = std::env::var("TTS_VOICE").ok();
        Ok(tts)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice_override: None,
            client,
        })
    }

    /// Set a fixed voice (e.g. "nova") instead of deriving it from the profile.
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice_override = Some(voice.into());
        self
    }

    fn voice_for(&self, profile: &ToneProfile) -> String {
        match &self.voice_override {
            Some(v) => v.clone(),
            None => style_to_voice(&profile.voice_style).to_string(),
        }
    }

    fn request_body(&self, text: &str, profile: &ToneProfile) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice_for(profile),
            "speed": profile.speech_rate.clamp(0.25, 4.0),
        })
    }
}

#[async_trait]
impl TtsBackend for OpenAiTts {
    async fn synthesize(&self, text: &str, profile: &ToneProfile) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(text, profile))
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Synthesis(format!(
                "TTS API error {}: {}",
                status, body
            )));
        }
        Ok(res.bytes().await?.to_vec())
    }
}

#[derive(Default)]
struct PlaceholderState {
    next_id: u64,
    live: Option<(u64, mpsc::UnboundedSender<SynthesisEvent>)>,
    spoken: Vec<(String, ToneProfile)>,
    cancelled: usize,
    fail_next: Option<String>,
    auto_finish: bool,
    latency: Duration,
}

/// Synthesizer that plays nothing; playback completion is driven by the caller.
///
/// Clones share state: the pipeline holds one, a test or demo keeps another to
/// call [`finish`](Self::finish) or [`fail`](Self::fail).
#[derive(Clone, Default)]
pub struct PlaceholderSynthesizer {
    state: Arc<Mutex<PlaceholderState>>,
}

impl PlaceholderSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every utterance ends as soon as it starts.
    pub fn auto_finishing() -> Self {
        let synth = Self::default();
        synth.lock().auto_finish = true;
        synth
    }

    /// Delay every `speak` call, like a slow TTS round trip.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlaceholderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `speak` call fail before playback starts.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.lock().fail_next = Some(message.into());
    }

    /// End the current utterance normally. Returns false if nothing is playing.
    pub fn finish(&self) -> bool {
        match self.lock().live.take() {
            Some((_, tx)) => tx.send(SynthesisEvent::Ended).is_ok(),
            None => false,
        }
    }

    /// Fail the current utterance mid-playback.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        match self.lock().live.take() {
            Some((_, tx)) => tx.send(SynthesisEvent::Error(message.into())).is_ok(),
            None => false,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.lock().live.is_some()
    }

    /// Texts passed to `speak`, oldest first.
    pub fn spoken(&self) -> Vec<String> {
        self.lock().spoken.iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn last_profile(&self) -> Option<ToneProfile> {
        self.lock().spoken.last().map(|(_, p)| p.clone())
    }

    /// How many times playback was cut off by `cancel`.
    pub fn cancelled_count(&self) -> usize {
        self.lock().cancelled
    }
}

#[async_trait]
impl SpeechSynthesizer for PlaceholderSynthesizer {
    async fn speak(&self, text: &str, profile: &ToneProfile) -> VoiceResult<SynthesisSession> {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut s = self.lock();
        if let Some(message) = s.fail_next.take() {
            return Err(VoiceError::Synthesis(message));
        }

        s.next_id += 1;
        let id = s.next_id;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SynthesisEvent::Started);
        s.spoken.push((text.to_string(), profile.clone()));
        if s.auto_finish {
            let _ = tx.send(SynthesisEvent::Ended);
        } else {
            s.live = Some((id, tx));
        }
        debug!(utterance = id, tone = %profile.tone, "placeholder speaking");
        Ok(SynthesisSession::new(id, rx))
    }

    fn cancel(&self) {
        let mut s = self.lock();
        if s.live.take().is_some() {
            s.cancelled += 1;
            info!("placeholder playback cancelled");
        }
    }
}

#[cfg(feature = "device")]
pub use device::RodioSynthesizer;

#[cfg(feature = "device")]
mod device {
    use super::*;
    use rodio::{OutputStream, Sink};
    use std::io::Cursor;
    use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
    use tracing::warn;

    const POLL_INTERVAL: Duration = Duration::from_millis(20);

    enum PlaybackCommand {
        Play {
            bytes: Vec<u8>,
            volume: f32,
            events: mpsc::UnboundedSender<SynthesisEvent>,
        },
        Stop,
    }

    /// Plays [`TtsBackend`] output on the default device through a rodio `Sink`.
    ///
    /// `OutputStream` is `!Send`, so the sink lives on a dedicated playback
    /// thread that polls for completion and obeys `Stop`.
    pub struct RodioSynthesizer {
        backend: Arc<dyn TtsBackend>,
        commands: Mutex<std_mpsc::Sender<PlaybackCommand>>,
        next_id: Mutex<u64>,
    }

    impl RodioSynthesizer {
        pub async fn new(backend: Arc<dyn TtsBackend>) -> VoiceResult<Self> {
            let (cmd_tx, cmd_rx) = std_mpsc::channel();
            let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
            std::thread::spawn(move || playback_thread(cmd_rx, ready_tx));
            ready_rx
                .await
                .map_err(|_| VoiceError::Playback("playback thread exited".to_string()))??;
            info!("RodioSynthesizer: sink ready for TTS playback");
            Ok(Self {
                backend,
                commands: Mutex::new(cmd_tx),
                next_id: Mutex::new(0),
            })
        }

        fn send(&self, command: PlaybackCommand) -> VoiceResult<()> {
            self.commands
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .send(command)
                .map_err(|e| VoiceError::ChannelSend(e.to_string()))
        }
    }

    fn new_sink(handle: &rodio::OutputStreamHandle) -> VoiceResult<Sink> {
        Sink::try_new(handle).map_err(|e| VoiceError::Playback(e.to_string()))
    }

    fn playback_thread(
        commands: std_mpsc::Receiver<PlaybackCommand>,
        ready: tokio::sync::oneshot::Sender<VoiceResult<()>>,
    ) {
        let (_stream, handle) = match OutputStream::try_default() {
            Ok(pair) => pair,
            Err(e) => {
                let _ = ready.send(Err(VoiceError::Playback(e.to_string())));
                return;
            }
        };
        let mut sink = match new_sink(&handle) {
            Ok(sink) => sink,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        let mut current: Option<mpsc::UnboundedSender<SynthesisEvent>> = None;
        loop {
            match commands.recv_timeout(POLL_INTERVAL) {
                Ok(PlaybackCommand::Play {
                    bytes,
                    volume,
                    events,
                }) => {
                    if current.take().is_some() {
                        sink.stop();
                    }
                    // A stopped sink does not resume; start from a fresh one.
                    match new_sink(&handle) {
                        Ok(fresh) => sink = fresh,
                        Err(e) => {
                            let _ = events.send(SynthesisEvent::Error(e.to_string()));
                            continue;
                        }
                    }
                    match rodio::Decoder::new(Cursor::new(bytes)) {
                        Ok(source) => {
                            sink.set_volume(volume);
                            sink.append(source);
                            let _ = events.send(SynthesisEvent::Started);
                            current = Some(events);
                        }
                        Err(e) => {
                            let _ = events
                                .send(SynthesisEvent::Error(format!("Decode failed: {}", e)));
                        }
                    }
                }
                Ok(PlaybackCommand::Stop) => {
                    sink.stop();
                    current = None;
                    debug!("RodioSynthesizer: stopped");
                }
                Err(RecvTimeoutError::Timeout) => {
                    if current.is_some() && sink.empty() {
                        if let Some(events) = current.take() {
                            let _ = events.send(SynthesisEvent::Ended);
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        warn!("RodioSynthesizer: playback thread ended");
    }

    #[async_trait]
    impl SpeechSynthesizer for RodioSynthesizer {
        async fn speak(&self, text: &str, profile: &ToneProfile) -> VoiceResult<SynthesisSession> {
            let bytes = self.backend.synthesize(text, profile).await?;
            let id = {
                let mut next = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
                *next += 1;
                *next
            };
            let (tx, rx) = mpsc::unbounded_channel();
            if bytes.is_empty() {
                let _ = tx.send(SynthesisEvent::Started);
                let _ = tx.send(SynthesisEvent::Ended);
            } else {
                self.send(PlaybackCommand::Play {
                    bytes,
                    volume: profile.volume,
                    events: tx,
                })?;
            }
            Ok(SynthesisSession::new(id, rx))
        }

        fn cancel(&self) {
            if let Err(e) = self.send(PlaybackCommand::Stop) {
                warn!("RodioSynthesizer: stop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tone::{profile_for, ToneType};

    #[tokio::test]
    async fn placeholder_tts_returns_empty() {
        let out = PlaceholderTts
            .synthesize("hello", &ToneProfile::default())
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn placeholder_reports_start_then_end() {
        let synth = PlaceholderSynthesizer::new();
        let mut session = synth
            .speak("hydra is a cluster", &profile_for(ToneType::Teaching))
            .await
            .unwrap();
        assert_eq!(session.recv().await, SynthesisEvent::Started);
        assert!(synth.is_playing());
        assert!(synth.finish());
        assert_eq!(session.recv().await, SynthesisEvent::Ended);
        assert_eq!(synth.spoken(), vec!["hydra is a cluster".to_string()]);
        assert_eq!(synth.last_profile().unwrap().tone, ToneType::Teaching);
    }

    #[tokio::test]
    async fn cancel_silences_current_utterance() {
        let synth = PlaceholderSynthesizer::new();
        let _session = synth.speak("long answer", &ToneProfile::default()).await.unwrap();
        synth.cancel();
        synth.cancel();
        assert!(!synth.is_playing());
        assert_eq!(synth.cancelled_count(), 1);
        assert!(!synth.finish());
    }

    #[tokio::test(start_paused = true)]
    async fn latency_delays_playback_start() {
        let synth = PlaceholderSynthesizer::new().with_latency(Duration::from_secs(2));
        let started = tokio::time::Instant::now();
        let _session = synth.speak("slow", &ToneProfile::default()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(synth.spoken(), vec!["slow".to_string()]);
    }

    #[test]
    fn openai_request_follows_profile() {
        let tts = OpenAiTts::new("http://localhost:9", "key", "tts-1").unwrap();
        let body = tts.request_body("hi", &profile_for(ToneType::Calm));
        assert_eq!(body["voice"], "alloy");
        assert!((body["speed"].as_f64().unwrap() - 0.85).abs() < 1e-6);

        let fixed = tts.with_voice("onyx");
        assert_eq!(fixed.request_body("hi", &ToneProfile::default())["voice"], "onyx");
    }
}
