//! Example: Voice Console
//!
//! Drives the full pipeline from the terminal with scripted audio, so it runs
//! anywhere. Lines you type:
//!
//!   ~hey ghostquant what is hydra   pretend to say something into the mic
//!   /wake                           manual activation (push-to-talk)
//!   /hands-free on|off              toggle the wake loop
//!   /quit                           shut down
//!   anything else                   typed question
//!
//! Playback finishes instantly; replies are printed instead of spoken.

use ghostquant_voice::{
    CannedResponder, EventBus, HandsFreeModeManager, PipelineDeps, PipelineEvent,
    PlaceholderSynthesizer, RecognitionMode, ScriptedCapture, ScriptedRecognizer,
    SledPreferenceStore, VoiceConfig, VoicePipeline,
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

    info!("🎤 GhostQuant Voice Console");
    info!("==========================");

    let config = VoiceConfig::load()?;
    let store = Arc::new(SledPreferenceStore::open(&config.preferences.path)?);
    let hands_free = Arc::new(HandsFreeModeManager::new(store)?);
    let recognizer = ScriptedRecognizer::new();

    let pipeline = VoicePipeline::new(
        config,
        PipelineDeps {
            capture: Arc::new(ScriptedCapture::new()),
            recognizer: Arc::new(recognizer.clone()),
            synthesizer: Arc::new(PlaceholderSynthesizer::auto_finishing()),
            responder: Arc::new(CannedResponder::default()),
            hands_free: Arc::clone(&hands_free),
            bus: EventBus::new(),
        },
    );

    let (handle, task) = pipeline.spawn();
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PipelineEvent::StateChanged { from, to } => println!("   [{} → {}]", from, to),
                PipelineEvent::ActivationCue => println!("   *ding*"),
                PipelineEvent::WakeWord { phrase, query } => {
                    println!("   wake: '{}' query: {:?}", phrase, query)
                }
                PipelineEvent::Transcript { text, is_final } => {
                    println!("   {} {}", if is_final { "final:" } else { "…" }, text)
                }
                PipelineEvent::UserUtterance(text) => println!("you: {}", text),
                PipelineEvent::Reply { text, tone } => println!("ghostquant ({}): {}", tone, text),
                PipelineEvent::Interrupted => println!("   (interrupted)"),
                PipelineEvent::Error(e) => println!("   error: {}", e),
                PipelineEvent::Volume(_) => {}
            }
        }
    });

    if hands_free.should_auto_start() || hands_free.is_enabled() {
        handle.start()?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(spoken) = line.strip_prefix('~') {
            let mode = if recognizer.is_open(RecognitionMode::SingleTurn) {
                RecognitionMode::SingleTurn
            } else {
                RecognitionMode::Continuous
            };
            if !recognizer.final_result(mode, spoken.trim()) {
                warn!("nobody is listening; try /wake or /hands-free on");
            }
            continue;
        }

        match line {
            "/quit" => break,
            "/wake" => handle.activate_manually()?,
            "/hands-free on" => {
                handle.set_hands_free(true)?;
                handle.start()?;
            }
            "/hands-free off" => handle.set_hands_free(false)?,
            text => handle.submit_text(text)?,
        }
    }

    handle.shutdown()?;
    task.await?;

    let stats = hands_free.get_state();
    info!(
        sessions = stats.session_count,
        active = ?stats.total_active_time,
        "👋 Goodbye!"
    );
    Ok(())
}
