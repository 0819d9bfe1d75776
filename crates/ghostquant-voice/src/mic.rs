//! **MicEngine** — microphone permission, capture lifecycle and level metering.
//!
//! The engine owns at most one [`AudioStream`]. Every frame handed to
//! [`MicEngine::process_frame`] is metered (frequency-domain RMS) and fed to a
//! one-shot silence detector. Failures never escape as `Err`; they become
//! [`MicEvent::Error`] and the engine moves to [`MicState::Error`].

use crate::capture::{AudioCapture, AudioFrame, AudioStream, CaptureConstraints, MicPermissionStatus, StreamInfo};
use crate::config::MicConfig;
use crate::error::VoiceError;
use crate::volume::{SilenceTracker, VolumeAnalyzer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capture lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MicState {
    Idle,
    Requesting,
    Active,
    Error,
}

/// Events emitted by the microphone engine
#[derive(Debug)]
pub enum MicEvent {
    StateChanged(MicState),
    /// Volume stayed under the silence threshold for the configured duration.
    /// Fires once per silent stretch.
    Silence { duration: Duration },
    Error(VoiceError),
}

pub struct MicEngine {
    config: MicConfig,
    capture: Arc<dyn AudioCapture>,
    state: MicState,
    permission: MicPermissionStatus,
    stream: Option<AudioStream>,
    analyzer: VolumeAnalyzer,
    silence: SilenceTracker,
    volume: f32,
    event_tx: mpsc::UnboundedSender<MicEvent>,
}

impl MicEngine {
    pub fn new(
        config: MicConfig,
        capture: Arc<dyn AudioCapture>,
    ) -> (Self, mpsc::UnboundedReceiver<MicEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let silence = SilenceTracker::new(config.silence_threshold, config.silence_duration());

        let engine = Self {
            config,
            capture,
            state: MicState::Idle,
            permission: MicPermissionStatus::Unknown,
            stream: None,
            analyzer: VolumeAnalyzer::new(),
            silence,
            volume: 0.0,
            event_tx,
        };

        (engine, event_rx)
    }

    pub fn state(&self) -> MicState {
        self.state
    }

    pub fn permission(&self) -> MicPermissionStatus {
        self.permission
    }

    pub fn is_active(&self) -> bool {
        self.state == MicState::Active
    }

    /// Last measured level (0 when not capturing).
    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Read the platform permission store without prompting.
    pub async fn query_permission(&mut self) -> MicPermissionStatus {
        self.permission = self.capture.query_permission().await;
        self.permission
    }

    /// Resolve permission by opening a throwaway capture session.
    pub async fn request_permission(&mut self) -> bool {
        let constraints = CaptureConstraints::from(&self.config);
        match self.capture.open(&constraints).await {
            Ok(mut probe) => {
                probe.release();
                self.permission = MicPermissionStatus::Granted;
                debug!("microphone permission granted");
                true
            }
            Err(e) => {
                if matches!(e, VoiceError::PermissionDenied(_)) {
                    self.permission = MicPermissionStatus::Denied;
                }
                warn!("microphone permission request failed: {}", e);
                false
            }
        }
    }

    /// Open the microphone and start metering. Returns `None` on failure.
    pub async fn start_listening(&mut self) -> Option<StreamInfo> {
        if let Some(stream) = &self.stream {
            return Some(stream.info().clone());
        }

        self.set_state(MicState::Requesting);
        let constraints = CaptureConstraints::from(&self.config);

        match self.capture.open(&constraints).await {
            Ok(stream) => {
                let info = stream.info().clone();
                self.permission = MicPermissionStatus::Granted;
                self.stream = Some(stream);
                self.silence.reset();
                self.volume = 0.0;
                info!(
                    device = %info.device,
                    sample_rate = info.sample_rate,
                    "🎤 microphone listening"
                );
                self.set_state(MicState::Active);
                Some(info)
            }
            Err(e) => {
                if matches!(e, VoiceError::PermissionDenied(_)) {
                    self.permission = MicPermissionStatus::Denied;
                }
                self.fail(e);
                None
            }
        }
    }

    /// Release the microphone. Safe to call repeatedly.
    pub fn stop_listening(&mut self) {
        let was_open = self.release();
        if was_open {
            info!("🛑 microphone released");
        }
        if self.state != MicState::Idle {
            self.set_state(MicState::Idle);
        }
    }

    /// Next captured frame. Pending while nothing is open; `None` means the
    /// device side closed the stream.
    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        match self.stream.as_mut() {
            Some(stream) => stream.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Handle the device side closing an open stream.
    pub fn on_stream_closed(&mut self) {
        if self.stream.is_some() {
            self.fail(VoiceError::Capture("microphone stream closed".to_string()));
        }
    }

    /// Meter one frame. Returns the normalized level.
    pub fn process_frame(&mut self, frame: &AudioFrame) -> f32 {
        if self.state != MicState::Active {
            return 0.0;
        }

        let level = self.analyzer.measure(&frame.samples);
        self.volume = level;

        if let Some(duration) = self.silence.observe(level, frame.timestamp) {
            debug!(?duration, "🤫 silence detected");
            self.emit(MicEvent::Silence { duration });
        }
        level
    }

    /// Start a fresh silence measurement (new turn on an already open stream).
    pub fn rearm_silence(&mut self) {
        self.silence.reset();
    }

    fn fail(&mut self, err: VoiceError) {
        warn!("microphone error: {}", err);
        self.release();
        self.set_state(MicState::Error);
        self.emit(MicEvent::Error(err));
    }

    /// Drop the stream and analysis state together.
    fn release(&mut self) -> bool {
        let was_open = match self.stream.take() {
            Some(mut stream) => {
                stream.release();
                true
            }
            None => false,
        };
        self.analyzer.reset();
        self.silence.reset();
        self.volume = 0.0;
        was_open
    }

    fn set_state(&mut self, state: MicState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "mic state");
            self.state = state;
            self.emit(MicEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: MicEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("mic event dropped: no receiver");
        }
    }
}

impl Drop for MicEngine {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ScriptedCapture;
    use tokio::time::Instant;

    fn engine(capture: &ScriptedCapture) -> (MicEngine, mpsc::UnboundedReceiver<MicEvent>) {
        MicEngine::new(MicConfig::default(), Arc::new(capture.clone()))
    }

    fn frame(level: f32, timestamp: Instant) -> AudioFrame {
        AudioFrame {
            samples: vec![level; 480],
            sample_rate: 16000,
            timestamp,
        }
    }

    #[tokio::test]
    async fn start_and_stop_release_the_device() {
        let capture = ScriptedCapture::new();
        let (mut mic, mut rx) = engine(&capture);

        let info = mic.start_listening().await.unwrap();
        assert_eq!(info.sample_rate, 16000);
        assert!(capture.is_open());
        assert_eq!(mic.state(), MicState::Active);
        assert_eq!(mic.permission(), MicPermissionStatus::Granted);

        mic.stop_listening();
        mic.stop_listening();
        assert!(!capture.is_open());
        assert_eq!(mic.state(), MicState::Idle);

        let mut states = Vec::new();
        while let Ok(MicEvent::StateChanged(s)) = rx.try_recv() {
            states.push(s);
        }
        assert_eq!(
            states,
            vec![MicState::Requesting, MicState::Active, MicState::Idle]
        );
    }

    #[tokio::test]
    async fn denial_is_distinguished_from_capture_failure() {
        let capture = ScriptedCapture::new();
        capture.deny_access();
        let (mut mic, mut rx) = engine(&capture);

        assert!(mic.start_listening().await.is_none());
        assert_eq!(mic.state(), MicState::Error);
        assert_eq!(mic.permission(), MicPermissionStatus::Denied);
        let mut saw_denied = false;
        while let Ok(ev) = rx.try_recv() {
            if let MicEvent::Error(VoiceError::PermissionDenied(_)) = ev {
                saw_denied = true;
            }
        }
        assert!(saw_denied);

        capture.allow();
        capture.fail_with("device busy");
        assert!(mic.start_listening().await.is_none());
        let mut saw_capture = false;
        while let Ok(ev) = rx.try_recv() {
            if let MicEvent::Error(VoiceError::Capture(_)) = ev {
                saw_capture = true;
            }
        }
        assert!(saw_capture);
    }

    #[tokio::test]
    async fn permission_probe_does_not_hold_the_device() {
        let capture = ScriptedCapture::new();
        let (mut mic, _rx) = engine(&capture);
        assert!(mic.request_permission().await);
        assert!(!capture.is_open());
        assert_eq!(capture.opened_count(), 1);
        assert_eq!(mic.state(), MicState::Idle);
    }

    #[tokio::test]
    async fn silence_fires_once_per_stretch() {
        let capture = ScriptedCapture::new();
        let (mut mic, mut rx) = engine(&capture);
        mic.start_listening().await.unwrap();
        while rx.try_recv().is_ok() {}

        let start = Instant::now();
        for ms in (0..=2600).step_by(30) {
            mic.process_frame(&frame(0.0, start + Duration::from_millis(ms)));
        }

        let mut silences = 0;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, MicEvent::Silence { .. }) {
                silences += 1;
            }
        }
        assert_eq!(silences, 1);
    }

    #[tokio::test]
    async fn frames_are_ignored_when_inactive() {
        let capture = ScriptedCapture::new();
        let (mut mic, _rx) = engine(&capture);
        assert_eq!(mic.process_frame(&frame(0.3, Instant::now())), 0.0);
    }

    #[tokio::test]
    async fn next_frame_pends_without_a_stream() {
        let capture = ScriptedCapture::new();
        let (mut mic, _rx) = engine(&capture);
        let mut next = tokio_test::task::spawn(mic.next_frame());
        tokio_test::assert_pending!(next.poll());
    }

    #[tokio::test]
    async fn disconnect_moves_to_error() {
        let capture = ScriptedCapture::new();
        let (mut mic, mut rx) = engine(&capture);
        mic.start_listening().await.unwrap();
        capture.disconnect();

        assert!(mic.next_frame().await.is_none());
        mic.on_stream_closed();
        assert_eq!(mic.state(), MicState::Error);
        let last = std::iter::from_fn(|| rx.try_recv().ok()).last();
        assert!(matches!(last, Some(MicEvent::Error(VoiceError::Capture(_)))));
    }
}
