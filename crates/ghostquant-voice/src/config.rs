//! Voice pipeline configuration.
//!
//! Every field has a default matching the pipeline constants below, so an empty
//! config file (or none at all) yields a working setup.
//!
//! | Source | Precedence |
//! |--------|------------|
//! | `GQ_VOICE__<SECTION>__<FIELD>` env vars | highest |
//! | file at `GHOSTQUANT_VOICE_CONFIG` or `config/voice.toml` | |
//! | struct defaults | lowest |

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Volume below this is treated as silence (normalized 0..1).
pub const SILENCE_THRESHOLD: f32 = 0.01;
/// Sustained silence before the microphone silence event fires.
pub const SILENCE_DURATION_MS: u64 = 2000;
/// Minimum gap between two wake triggers.
pub const WAKE_COOLDOWN_MS: u64 = 3000;
/// Number of finalized fragments kept for wake matching.
pub const WAKE_BUFFER_SIZE: usize = 5;
/// Gap after the last final transcript before speech end is declared.
pub const STT_SILENCE_TIMEOUT_MS: u64 = 1500;
/// Barge-in fires when volume exceeds `silence_threshold * INTERRUPT_MULTIPLIER`.
pub const INTERRUPT_MULTIPLIER: f32 = 5.0;
/// Delay between activation and the start of the listening turn.
pub const SETTLE_DELAY_MS: u64 = 500;

/// Wake phrase variants (English only).
pub const DEFAULT_WAKE_PHRASES: &[&str] = &[
    "hey ghostquant",
    "hey ghost quant",
    "hi ghostquant",
    "ok ghostquant",
    "okay ghostquant",
    "hello ghostquant",
];

const CONFIG_PATH_ENV: &str = "GHOSTQUANT_VOICE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/voice.toml";
const ENV_PREFIX: &str = "GQ_VOICE";

fn default_true() -> bool {
    true
}

fn default_language() -> String {
    "en-US".to_string()
}

/// Microphone capture and silence detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MicConfig {
    pub silence_threshold: f32,
    pub silence_duration_ms: u64,
    #[serde(default = "default_true")]
    pub echo_cancellation: bool,
    #[serde(default = "default_true")]
    pub noise_suppression: bool,
    #[serde(default = "default_true")]
    pub auto_gain_control: bool,
    /// Requested capture rate in Hz (default 16000).
    pub sample_rate: u32,
}

impl Default for MicConfig {
    fn default() -> Self {
        Self {
            silence_threshold: SILENCE_THRESHOLD,
            silence_duration_ms: SILENCE_DURATION_MS,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: 16000,
        }
    }
}

impl MicConfig {
    pub fn silence_duration(&self) -> Duration {
        Duration::from_millis(self.silence_duration_ms)
    }
}

/// Wake phrase detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeWordConfig {
    pub phrases: Vec<String>,
    pub cooldown_ms: u64,
    pub buffer_size: usize,
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for WakeWordConfig {
    fn default() -> Self {
        Self {
            phrases: DEFAULT_WAKE_PHRASES.iter().map(|p| p.to_string()).collect(),
            cooldown_ms: WAKE_COOLDOWN_MS,
            buffer_size: WAKE_BUFFER_SIZE,
            language: default_language(),
        }
    }
}

impl WakeWordConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Streaming recognition during an active turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_true")]
    pub interim_results: bool,
    pub max_alternatives: u8,
    pub silence_timeout_ms: u64,
    pub silence_threshold: f32,
    pub interrupt_multiplier: f32,
    /// When true the first final transcript closes the turn; otherwise only the silence timeout does.
    #[serde(default = "default_true")]
    pub single_turn: bool,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            interim_results: true,
            max_alternatives: 1,
            silence_timeout_ms: STT_SILENCE_TIMEOUT_MS,
            silence_threshold: SILENCE_THRESHOLD,
            interrupt_multiplier: INTERRUPT_MULTIPLIER,
            single_turn: true,
        }
    }
}

impl SttConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    /// Volume above which user speech interrupts system playback.
    pub fn interrupt_level(&self) -> f32 {
        self.silence_threshold * self.interrupt_multiplier
    }
}

/// Orchestrator behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub settle_delay_ms: u64,
    /// Speak replies through the synthesizer (default true).
    #[serde(default = "default_true")]
    pub speech_output: bool,
    /// Keep the microphone open while speaking so the user can interrupt (default true).
    #[serde(default = "default_true")]
    pub barge_in: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: SETTLE_DELAY_MS,
            speech_output: true,
            barge_in: true,
        }
    }
}

impl PipelineConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Where hands-free preferences live on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferencesConfig {
    pub path: String,
}

impl Default for PreferencesConfig {
    fn default() -> Self {
        Self {
            path: "./data/ghostquant_voice".to_string(),
        }
    }
}

/// Full voice configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub mic: MicConfig,
    pub wake: WakeWordConfig,
    pub stt: SttConfig,
    pub pipeline: PipelineConfig,
    pub preferences: PreferencesConfig,
}

impl VoiceConfig {
    /// Load config from file and environment. Precedence: env `GQ_VOICE__*` > file > defaults.
    pub fn load() -> VoiceResult<Self> {
        let _ = dotenvy::dotenv();
        let config_path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let builder = config::Config::builder();
        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: VoiceConfig = built.try_deserialize()?;
        cfg.validate()?;
        tracing::debug!(path = %config_path, "voice config loaded");
        Ok(cfg)
    }

    /// Parse a TOML document on top of the defaults.
    pub fn from_toml_str(toml: &str) -> VoiceResult<Self> {
        let built = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        let cfg: VoiceConfig = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the engines cannot work with.
    pub fn validate(&self) -> VoiceResult<()> {
        for (name, value) in [
            ("mic.silence_threshold", self.mic.silence_threshold),
            ("stt.silence_threshold", self.stt.silence_threshold),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(VoiceError::Config(format!(
                    "{} must be within (0, 1), got {}",
                    name, value
                )));
            }
        }
        if self.stt.interrupt_multiplier < 1.0 {
            return Err(VoiceError::Config(format!(
                "stt.interrupt_multiplier must be >= 1, got {}",
                self.stt.interrupt_multiplier
            )));
        }
        if self.wake.buffer_size == 0 {
            return Err(VoiceError::Config("wake.buffer_size must be at least 1".to_string()));
        }
        if self.wake.phrases.iter().all(|p| p.trim().is_empty()) {
            return Err(VoiceError::Config("wake.phrases must not be empty".to_string()));
        }
        if self.stt.max_alternatives == 0 {
            return Err(VoiceError::Config("stt.max_alternatives must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let c = VoiceConfig::default();
        assert!((c.mic.silence_threshold - 0.01).abs() < 1e-6);
        assert_eq!(c.mic.silence_duration(), Duration::from_millis(2000));
        assert_eq!(c.wake.cooldown(), Duration::from_millis(3000));
        assert_eq!(c.wake.buffer_size, 5);
        assert_eq!(c.stt.silence_timeout(), Duration::from_millis(1500));
        assert!((c.stt.interrupt_level() - 0.05).abs() < 1e-6);
        assert_eq!(c.pipeline.settle_delay(), Duration::from_millis(500));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn toml_overrides_only_named_fields() {
        let c = VoiceConfig::from_toml_str(
            r#"
            [stt]
            silence_timeout_ms = 900
            single_turn = false

            [pipeline]
            speech_output = false
            "#,
        )
        .unwrap();
        assert_eq!(c.stt.silence_timeout_ms, 900);
        assert!(!c.stt.single_turn);
        assert!(!c.pipeline.speech_output);
        assert!(c.pipeline.barge_in);
        assert_eq!(c.wake.cooldown_ms, WAKE_COOLDOWN_MS);
    }

    #[test]
    fn sample_config_file_parses() {
        let c = VoiceConfig::from_toml_str(include_str!("../../../config/voice.toml")).unwrap();
        assert_eq!(c.wake.phrases.len(), DEFAULT_WAKE_PHRASES.len());
        assert_eq!(c.preferences.path, "./data/ghostquant_voice");
    }

    #[test]
    fn rejects_bad_threshold() {
        let mut c = VoiceConfig::default();
        c.mic.silence_threshold = 1.5;
        assert!(matches!(c.validate(), Err(VoiceError::Config(_))));
    }

    #[test]
    fn rejects_empty_phrases() {
        let mut c = VoiceConfig::default();
        c.wake.phrases = vec!["  ".to_string()];
        assert!(c.validate().is_err());
    }
}
