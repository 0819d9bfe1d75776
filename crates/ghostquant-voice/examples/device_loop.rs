//! Example: Device Loop
//!
//! Real microphone (CPAL) and speaker (rodio) with typed recognition results.
//! Metering, silence detection and barge-in all run on live audio: talk over a
//! reply to interrupt it.
//!
//! Replies are voiced through an OpenAI-compatible TTS endpoint when
//! `TTS_API_KEY` (or `OPENAI_API_KEY`) is set, otherwise playback is silent.
//!
//!   cargo run --example device_loop --features device

use ghostquant_voice::{
    CannedResponder, CpalCapture, EventBus, HandsFreeModeManager, MemoryPreferenceStore,
    OpenAiTts, PipelineDeps, PipelineEvent, PlaceholderTts, RecognitionMode, RodioSynthesizer,
    ScriptedRecognizer, TtsBackend, VoiceConfig, VoicePipeline,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("🎙️ GhostQuant Device Loop");
    for device in CpalCapture::list_input_devices()? {
        info!("   input: {}", device);
    }

    let backend: Arc<dyn TtsBackend> = match OpenAiTts::from_env() {
        Ok(tts) => {
            info!(model = %tts.model, "using OpenAI-compatible TTS");
            Arc::new(tts)
        }
        Err(e) => {
            warn!("{}; replies will be silent", e);
            Arc::new(PlaceholderTts)
        }
    };

    let config = VoiceConfig::load()?;
    let hands_free = Arc::new(HandsFreeModeManager::new(Arc::new(
        MemoryPreferenceStore::new(),
    ))?);
    hands_free.enable()?;
    let recognizer = ScriptedRecognizer::new();

    let pipeline = VoicePipeline::new(
        config,
        PipelineDeps {
            capture: Arc::new(CpalCapture::new()),
            recognizer: Arc::new(recognizer.clone()),
            synthesizer: Arc::new(RodioSynthesizer::new(backend).await?),
            responder: Arc::new(CannedResponder::default()),
            hands_free,
            bus: EventBus::new(),
        },
    );

    let (handle, task) = pipeline.spawn();
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PipelineEvent::Volume(level) if level > 0.05 => info!("🔊 {:.3}", level),
                PipelineEvent::Volume(_) => {}
                PipelineEvent::StateChanged { to, .. } => info!("state: {}", to),
                PipelineEvent::Reply { text, tone } => info!("💬 ({}) {}", tone, text),
                other => info!("{:?}", other),
            }
        }
    });
    handle.start()?;

    info!("Type what you would say (start with 'hey ghostquant'). Ctrl+D to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mode = if recognizer.is_open(RecognitionMode::SingleTurn) {
            RecognitionMode::SingleTurn
        } else {
            RecognitionMode::Continuous
        };
        if !recognizer.final_result(mode, line.trim()) {
            warn!("no recognition session is open");
        }
    }

    handle.shutdown()?;
    task.await?;
    info!("👋 Goodbye!");
    Ok(())
}
