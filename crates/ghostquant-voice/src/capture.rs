//! Microphone capability.
//!
//! The pipeline never touches an audio device directly. It opens an
//! [`AudioStream`] through an [`AudioCapture`] implementation and releases it
//! through the stream's guard. `ScriptedCapture` drives the pipeline from tests
//! and demos; `CpalCapture` (feature `device`) reads the default input device.

use crate::config::MicConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Platform permission for the microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MicPermissionStatus {
    #[default]
    Unknown,
    Granted,
    Denied,
    Prompt,
}

/// One block of captured mono samples.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Audio samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// When the block was captured
    pub timestamp: Instant,
}

/// Processing hints requested when opening a capture session.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
    pub channels: u16,
}

impl From<&MicConfig> for CaptureConstraints {
    fn from(config: &MicConfig) -> Self {
        Self {
            echo_cancellation: config.echo_cancellation,
            noise_suppression: config.noise_suppression,
            auto_gain_control: config.auto_gain_control,
            sample_rate: config.sample_rate,
            channels: 1,
        }
    }
}

/// Describes an open capture session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub device: String,
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// A live capture session. Dropping or releasing it frees the device.
pub struct AudioStream {
    info: StreamInfo,
    frames: mpsc::UnboundedReceiver<AudioFrame>,
    release: Option<ReleaseFn>,
}

impl AudioStream {
    pub fn new(
        info: StreamInfo,
        frames: mpsc::UnboundedReceiver<AudioFrame>,
        release: Option<ReleaseFn>,
    ) -> Self {
        Self {
            info,
            frames,
            release,
        }
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Next captured frame; `None` once the device side has closed.
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        self.frames.recv().await
    }

    /// Release the device. Idempotent.
    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
        self.frames.close();
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Audio capture capability (platform microphone access).
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Read the permission store without prompting.
    async fn query_permission(&self) -> MicPermissionStatus;

    /// Open a capture session. Permission denial must be reported as
    /// [`VoiceError::PermissionDenied`], everything else as [`VoiceError::Capture`].
    async fn open(&self, constraints: &CaptureConstraints) -> VoiceResult<AudioStream>;
}

#[derive(Default)]
struct ScriptedCaptureState {
    permission: MicPermissionStatus,
    deny: bool,
    failure: Option<String>,
    next_id: u64,
    live: Option<(u64, mpsc::UnboundedSender<AudioFrame>)>,
    opened: usize,
    last_constraints: Option<CaptureConstraints>,
}

/// In-memory microphone: frames are pushed by the caller.
///
/// Clones share state, so a test keeps one clone as the controller and hands
/// another to the pipeline.
#[derive(Clone, Default)]
pub struct ScriptedCapture {
    state: Arc<Mutex<ScriptedCaptureState>>,
}

impl ScriptedCapture {
    pub const SAMPLE_RATE: u32 = 16000;

    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedCaptureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `open` calls fail with a permission denial.
    pub fn deny_access(&self) {
        let mut s = self.lock();
        s.deny = true;
        s.permission = MicPermissionStatus::Denied;
    }

    /// Make the next `open` calls fail with a device error.
    pub fn fail_with(&self, message: impl Into<String>) {
        self.lock().failure = Some(message.into());
    }

    /// Clear any scripted failure.
    pub fn allow(&self) {
        let mut s = self.lock();
        s.deny = false;
        s.failure = None;
        if s.permission == MicPermissionStatus::Denied {
            s.permission = MicPermissionStatus::Prompt;
        }
    }

    pub fn set_permission(&self, status: MicPermissionStatus) {
        self.lock().permission = status;
    }

    /// Push raw samples into the open stream. Returns false when nothing is open.
    pub fn push_frame(&self, samples: Vec<f32>) -> bool {
        let s = self.lock();
        match &s.live {
            Some((_, tx)) => tx
                .send(AudioFrame {
                    samples,
                    sample_rate: Self::SAMPLE_RATE,
                    timestamp: Instant::now(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Push a 30 ms block of constant amplitude; its measured volume equals `level`.
    pub fn push_level(&self, level: f32) -> bool {
        self.push_frame(vec![level; 480])
    }

    /// Drop the device side of the open stream, as an unplugged microphone would.
    pub fn disconnect(&self) {
        self.lock().live = None;
    }

    pub fn is_open(&self) -> bool {
        self.lock().live.is_some()
    }

    /// How many sessions were opened in total (including permission probes).
    pub fn opened_count(&self) -> usize {
        self.lock().opened
    }

    pub fn last_constraints(&self) -> Option<CaptureConstraints> {
        self.lock().last_constraints.clone()
    }
}

#[async_trait]
impl AudioCapture for ScriptedCapture {
    async fn query_permission(&self) -> MicPermissionStatus {
        self.lock().permission
    }

    async fn open(&self, constraints: &CaptureConstraints) -> VoiceResult<AudioStream> {
        let mut s = self.lock();
        s.last_constraints = Some(constraints.clone());
        if s.deny {
            s.permission = MicPermissionStatus::Denied;
            return Err(VoiceError::PermissionDenied(
                "user dismissed the microphone prompt".to_string(),
            ));
        }
        if let Some(message) = s.failure.clone() {
            return Err(VoiceError::Capture(message));
        }

        s.permission = MicPermissionStatus::Granted;
        s.next_id += 1;
        s.opened += 1;
        let id = s.next_id;
        let (tx, rx) = mpsc::unbounded_channel();
        s.live = Some((id, tx));
        debug!(stream = id, "scripted capture opened");

        let state = Arc::clone(&self.state);
        let release: ReleaseFn = Box::new(move || {
            let mut s = state.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(s.live, Some((live_id, _)) if live_id == id) {
                s.live = None;
            }
        });

        Ok(AudioStream::new(
            StreamInfo {
                sample_rate: Self::SAMPLE_RATE,
                channels: 1,
                device: "scripted".to_string(),
            },
            rx,
            Some(release),
        ))
    }
}

#[cfg(feature = "device")]
pub use device::CpalCapture;

#[cfg(feature = "device")]
mod device {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use tracing::{info, warn};

    /// Default input device via CPAL.
    ///
    /// The CPAL stream is `!Send` on some platforms, so it lives on a dedicated
    /// thread that parks until the [`AudioStream`] is released.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct CpalCapture;

    impl CpalCapture {
        pub fn new() -> Self {
            Self
        }

        /// List available input devices
        pub fn list_input_devices() -> VoiceResult<Vec<String>> {
            let host = cpal::default_host();
            let devices = host.input_devices()?;
            Ok(devices.filter_map(|d| d.name().ok()).collect())
        }
    }

    fn build_stream(
        constraints: &CaptureConstraints,
        frame_tx: mpsc::UnboundedSender<AudioFrame>,
    ) -> VoiceResult<(cpal::Stream, StreamInfo)> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let default_config = device.default_input_config()?;
        let channels = default_config.channels();
        let sample_rate = default_config.sample_rate().0;
        if sample_rate != constraints.sample_rate {
            debug!(
                requested = constraints.sample_rate,
                actual = sample_rate,
                "capturing at device rate"
            );
        }
        // Echo cancellation, noise suppression and AGC are not exposed by CPAL.
        debug!(
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            auto_gain_control = constraints.auto_gain_control,
            "processing hints ignored by cpal"
        );

        let stream_config: cpal::StreamConfig = default_config.config();
        let stride = usize::from(channels.max(1));
        let stream = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data
                    .chunks(stride)
                    .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                    .collect();
                let _ = frame_tx.send(AudioFrame {
                    samples,
                    sample_rate,
                    timestamp: Instant::now(),
                });
            },
            move |err| {
                warn!("Audio stream error: {}", err);
            },
            None,
        )?;
        stream.play()?;

        Ok((
            stream,
            StreamInfo {
                sample_rate,
                channels: 1,
                device: name,
            },
        ))
    }

    #[async_trait]
    impl AudioCapture for CpalCapture {
        async fn query_permission(&self) -> MicPermissionStatus {
            // Desktop hosts have no prompt; a visible input device means access.
            match cpal::default_host().default_input_device() {
                Some(_) => MicPermissionStatus::Granted,
                None => MicPermissionStatus::Unknown,
            }
        }

        async fn open(&self, constraints: &CaptureConstraints) -> VoiceResult<AudioStream> {
            let (frame_tx, frame_rx) = mpsc::unbounded_channel();
            let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
            let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
            let constraints = constraints.clone();

            std::thread::spawn(move || match build_stream(&constraints, frame_tx) {
                Ok((stream, info)) => {
                    let _ = ready_tx.send(Ok(info));
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!("cpal capture released");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            });

            let info = ready_rx
                .await
                .map_err(|_| VoiceError::Capture("capture thread exited".to_string()))??;
            info!(device = %info.device, sample_rate = info.sample_rate, "microphone opened");

            Ok(AudioStream::new(
                info,
                frame_rx,
                Some(Box::new(move || {
                    let _ = stop_tx.send(());
                })),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_stream_delivers_frames_until_released() {
        let capture = ScriptedCapture::new();
        let mut stream = capture
            .open(&CaptureConstraints::from(&MicConfig::default()))
            .await
            .unwrap();
        assert!(capture.is_open());
        assert!(capture.push_level(0.2));

        let frame = stream.recv().await.unwrap();
        assert_eq!(frame.samples.len(), 480);

        stream.release();
        assert!(!capture.is_open());
        assert!(!capture.push_level(0.2));
    }

    #[tokio::test]
    async fn denial_is_reported_as_permission_error() {
        let capture = ScriptedCapture::new();
        capture.deny_access();
        let err = capture
            .open(&CaptureConstraints::from(&MicConfig::default()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, VoiceError::PermissionDenied(_)));
        assert_eq!(capture.query_permission().await, MicPermissionStatus::Denied);
    }

    #[tokio::test]
    async fn constraints_carry_processing_hints() {
        let capture = ScriptedCapture::new();
        let _stream = capture
            .open(&CaptureConstraints::from(&MicConfig::default()))
            .await
            .unwrap();
        let c = capture.last_constraints().unwrap();
        assert!(c.echo_cancellation && c.noise_suppression && c.auto_gain_control);
    }
}
