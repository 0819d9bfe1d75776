//! Error types for the GhostQuant voice pipeline

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice pipeline
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio capture error: {0}")]
    Capture(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Speech recognition error: {0}")]
    Recognition(String),

    #[error("Speech recognition unsupported on this platform")]
    RecognitionUnsupported,

    #[error("Speech synthesis error: {0}")]
    Synthesis(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Invalid transition: cannot {action} while {state}")]
    InvalidTransition {
        state: String,
        action: &'static str,
    },

    #[error("Preference store error: {0}")]
    Preferences(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl VoiceError {
    /// Permission and capture failures share a handling path but stay distinguishable.
    pub fn is_capture_failure(&self) -> bool {
        matches!(
            self,
            VoiceError::PermissionDenied(_) | VoiceError::Capture(_) | VoiceError::AudioDevice(_)
        )
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::Capture(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::Capture(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_failures_are_grouped() {
        assert!(VoiceError::PermissionDenied("denied".into()).is_capture_failure());
        assert!(VoiceError::Capture("busy".into()).is_capture_failure());
        assert!(!VoiceError::Recognition("network".into()).is_capture_failure());
    }

    #[test]
    fn invalid_transition_message() {
        let err = VoiceError::InvalidTransition {
            state: "speaking".into(),
            action: "activate manually",
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition: cannot activate manually while speaking"
        );
    }
}
