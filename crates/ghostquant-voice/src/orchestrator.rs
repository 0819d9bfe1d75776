//! Voice Pipeline - The main coordination layer
//!
//! [`VoicePipeline`] owns every engine and the single [`PipelineState`]. It is
//! driven one input at a time by [`VoicePipeline::step`]:
//!
//! 1. a biased `select!` awaits exactly one input (command, recognition event
//!    from either session, synthesized reply ready, synthesis progress,
//!    microphone frame, settle deadline, STT silence deadline, hands-free
//!    preference change),
//! 2. the input is dispatched,
//! 3. every engine channel is drained before `step` returns.
//!
//! Because all of this happens through `&mut self`, no two transitions are ever
//! in flight. Speech synthesis runs on its own task while the pipeline sits in
//! `processing`, so a stop or shutdown is never stuck behind a TTS fetch. Handlers check the state they apply to, so late or duplicate
//! events are no-ops.
//!
//! ```text
//! idle ──start()──▶ wake_listening ──wake──▶ activated ──settle──▶ listening
//!   ▲                    ▲                                              │
//!   │                    └────────── speaking ◀── processing ◀──────────┘
//!   └──────────── (hands-free off)       │ interrupt
//!                                        └────────────▶ listening
//! ```

use crate::capture::{AudioCapture, AudioFrame};
use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::events::EventBus;
use crate::hands_free::HandsFreeModeManager;
use crate::intent::IntentKind;
use crate::mic::{MicEngine, MicEvent};
use crate::recognition::SpeechRecognizer;
use crate::responder::ResponseGenerator;
use crate::stt::{StreamingSttEngine, SttEvent};
use crate::synthesis::{SpeechSynthesizer, SynthesisEvent, SynthesisSession};
use crate::tone::{ConversationContext, ToneEngine, ToneProfile, ToneSelection, ToneType};
use crate::turn::{Speaker, TurnEvent, TurnTakingManager};
use crate::wake_word::{WakeEvent, WakeWordEngine};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;
const RECENT_TURNS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    WakeListening,
    Activated,
    Listening,
    Processing,
    Speaking,
    Error,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::WakeListening => "wake_listening",
            PipelineState::Activated => "activated",
            PipelineState::Listening => "listening",
            PipelineState::Processing => "processing",
            PipelineState::Speaking => "speaking",
            PipelineState::Error => "error",
        }
    }

    /// States in which a conversational turn owns the microphone.
    fn in_turn(&self) -> bool {
        matches!(
            self,
            PipelineState::Activated
                | PipelineState::Listening
                | PipelineState::Processing
                | PipelineState::Speaking
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications for the UI layer (orb animation, transcript view).
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
    /// Play the activation chime / pulse the orb.
    ActivationCue,
    WakeWord {
        phrase: String,
        query: Option<String>,
    },
    Transcript {
        text: String,
        is_final: bool,
    },
    UserUtterance(String),
    Reply {
        text: String,
        tone: ToneType,
    },
    Interrupted,
    Volume(f32),
    Error(String),
}

/// Commands accepted by [`PipelineHandle`].
#[derive(Debug, Clone)]
pub enum PipelineCommand {
    Start,
    Stop,
    ActivateManually,
    SubmitText(String),
    SetSpeechOutput(bool),
    SetHandsFree(bool),
    SetContext(ConversationContext),
    /// Stop and leave the `run` loop.
    Shutdown,
}

/// Capabilities and shared services the pipeline is built from.
pub struct PipelineDeps {
    pub capture: Arc<dyn AudioCapture>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub responder: Arc<dyn ResponseGenerator>,
    pub hands_free: Arc<HandsFreeModeManager>,
    pub bus: EventBus,
}

/// Cloneable sender for a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    commands: mpsc::UnboundedSender<PipelineCommand>,
    events: broadcast::Sender<PipelineEvent>,
}

impl PipelineHandle {
    pub fn send(&self, command: PipelineCommand) -> VoiceResult<()> {
        self.commands
            .send(command)
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    pub fn start(&self) -> VoiceResult<()> {
        self.send(PipelineCommand::Start)
    }

    pub fn stop(&self) -> VoiceResult<()> {
        self.send(PipelineCommand::Stop)
    }

    pub fn activate_manually(&self) -> VoiceResult<()> {
        self.send(PipelineCommand::ActivateManually)
    }

    pub fn submit_text(&self, text: impl Into<String>) -> VoiceResult<()> {
        self.send(PipelineCommand::SubmitText(text.into()))
    }

    pub fn set_speech_output(&self, enabled: bool) -> VoiceResult<()> {
        self.send(PipelineCommand::SetSpeechOutput(enabled))
    }

    pub fn set_hands_free(&self, enabled: bool) -> VoiceResult<()> {
        self.send(PipelineCommand::SetHandsFree(enabled))
    }

    pub fn set_context(&self, context: ConversationContext) -> VoiceResult<()> {
        self.send(PipelineCommand::SetContext(context))
    }

    pub fn shutdown(&self) -> VoiceResult<()> {
        self.send(PipelineCommand::Shutdown)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Result of a spawned `SpeechSynthesizer::speak`. Pending while none runs.
async fn join_speech(
    task: &mut Option<JoinHandle<VoiceResult<SynthesisSession>>>,
) -> VoiceResult<SynthesisSession> {
    match task.as_mut() {
        Some(task) => match task.await {
            Ok(result) => result,
            Err(e) => Err(VoiceError::Synthesis(format!("speech task ended: {}", e))),
        },
        None => std::future::pending().await,
    }
}

async fn recv_synthesis(session: &mut Option<SynthesisSession>) -> SynthesisEvent {
    match session.as_mut() {
        Some(session) => session.recv().await,
        None => std::future::pending().await,
    }
}

/// The orchestrator state machine.
pub struct VoicePipeline {
    config: VoiceConfig,
    state: PipelineState,
    started: bool,
    speech_output: bool,

    mic: MicEngine,
    mic_rx: mpsc::UnboundedReceiver<MicEvent>,
    wake: WakeWordEngine,
    wake_rx: mpsc::UnboundedReceiver<WakeEvent>,
    stt: StreamingSttEngine,
    stt_rx: mpsc::UnboundedReceiver<SttEvent>,
    turns: Arc<TurnTakingManager>,
    turn_rx: mpsc::UnboundedReceiver<TurnEvent>,
    tone: ToneEngine,

    synthesizer: Arc<dyn SpeechSynthesizer>,
    responder: Arc<dyn ResponseGenerator>,
    hands_free: Arc<HandsFreeModeManager>,
    hands_free_rx: watch::Receiver<bool>,
    bus: EventBus,
    context: ConversationContext,

    speech_task: Option<JoinHandle<VoiceResult<SynthesisSession>>>,
    synthesis: Option<SynthesisSession>,
    settle_deadline: Option<Instant>,
    pending_seed: Option<String>,
    last_error: Option<String>,

    events: broadcast::Sender<PipelineEvent>,
    commands_tx: mpsc::UnboundedSender<PipelineCommand>,
    commands_rx: mpsc::UnboundedReceiver<PipelineCommand>,
}

impl VoicePipeline {
    pub fn new(config: VoiceConfig, deps: PipelineDeps) -> Self {
        info!("🎭 Initializing voice pipeline");

        let (mic, mic_rx) = MicEngine::new(config.mic.clone(), deps.capture);
        let (wake, wake_rx) = WakeWordEngine::new(config.wake.clone(), Arc::clone(&deps.recognizer));
        let (turns, turn_rx) = TurnTakingManager::new(Arc::clone(&deps.synthesizer));
        let (stt, stt_rx) = StreamingSttEngine::new(
            config.stt.clone(),
            deps.recognizer,
            turns.clone(),
            deps.bus.clone(),
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let hands_free_rx = deps.hands_free.subscribe();

        Self {
            speech_output: config.pipeline.speech_output,
            config,
            state: PipelineState::Idle,
            started: false,
            mic,
            mic_rx,
            wake,
            wake_rx,
            stt,
            stt_rx,
            turns,
            turn_rx,
            tone: ToneEngine::new(),
            synthesizer: deps.synthesizer,
            responder: deps.responder,
            hands_free: deps.hands_free,
            hands_free_rx,
            bus: deps.bus,
            context: ConversationContext::default(),
            speech_task: None,
            synthesis: None,
            settle_deadline: None,
            pending_seed: None,
            last_error: None,
            events,
            commands_tx,
            commands_rx,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            commands: self.commands_tx.clone(),
            events: self.events.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn hands_free(&self) -> &Arc<HandsFreeModeManager> {
        &self.hands_free
    }

    pub fn speaker(&self) -> Speaker {
        self.turns.speaker()
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    pub fn set_context(&mut self, context: ConversationContext) {
        self.context = context;
    }

    pub fn speech_output(&self) -> bool {
        self.speech_output
    }

    pub fn set_speech_output(&mut self, enabled: bool) {
        self.speech_output = enabled;
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Transcript accumulated in the current listening turn.
    pub fn current_transcript(&self) -> &str {
        self.stt.accumulated_transcript()
    }

    /// Enter the resting state: `wake_listening` with hands-free on, else `idle`.
    /// Also the only way out of `error`.
    pub async fn start(&mut self) {
        if self.started && !matches!(self.state, PipelineState::Idle | PipelineState::Error) {
            debug!(state = %self.state, "start ignored: already running");
            return;
        }
        info!("🚀 Starting voice pipeline");
        self.started = true;
        self.last_error = None;
        self.enter_rest().await;
        self.drain_engine_events().await;
    }

    /// Tear everything down to `idle`. Safe from any state.
    pub fn stop(&mut self) {
        info!("🛑 Stopping voice pipeline");
        self.started = false;
        self.teardown();
        self.set_state(PipelineState::Idle);
    }

    /// Equivalent to a wake trigger. Valid from `idle` or `wake_listening`.
    pub async fn activate_manually(&mut self) -> VoiceResult<()> {
        match self.state {
            PipelineState::Idle | PipelineState::WakeListening => {
                self.started = true;
                self.activate("manual", None).await;
                self.drain_engine_events().await;
                Ok(())
            }
            state => Err(VoiceError::InvalidTransition {
                state: state.to_string(),
                action: "activate manually",
            }),
        }
    }

    /// Typed input: reply without touching the audio states, unless speech
    /// output is on, in which case the reply is spoken.
    pub async fn submit_text(&mut self, text: &str) -> Option<String> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        self.broadcast(PipelineEvent::UserUtterance(text.to_string()));
        let (reply, selection) = self.compose_reply(text);

        if self.speech_output && self.state != PipelineState::Error {
            self.settle_deadline = None;
            self.pending_seed = None;
            self.wake.disable();
            self.stt.stop();
            self.cancel_speech();
            self.set_state(PipelineState::Processing);
            self.speak(&reply, &selection.profile);
            self.drain_engine_events().await;
        }
        Some(reply)
    }

    /// Await one input, apply it, then drain engine events.
    /// Returns false once a `Shutdown` command was processed.
    pub async fn step(&mut self) -> bool {
        let settle = self.settle_deadline;
        let silence = self.stt.silence_deadline();

        let keep_running = tokio::select! {
            biased;

            Some(command) = self.commands_rx.recv() => self.handle_command(command).await,
            event = self.wake.next_recognition() => {
                self.wake.handle_recognition(event).await;
                true
            }
            event = self.stt.next_recognition() => {
                self.stt.handle_recognition(event).await;
                true
            }
            result = join_speech(&mut self.speech_task) => {
                self.speech_task = None;
                self.on_speech_ready(result).await;
                true
            }
            event = recv_synthesis(&mut self.synthesis) => {
                self.on_synthesis(event).await;
                true
            }
            frame = self.mic.next_frame() => {
                match frame {
                    Some(frame) => self.on_frame(frame),
                    None => self.mic.on_stream_closed(),
                }
                true
            }
            _ = sleep_until_opt(settle) => {
                self.on_settled().await;
                true
            }
            _ = sleep_until_opt(silence) => {
                self.stt.on_silence_timeout(Instant::now());
                true
            }
            Ok(()) = self.hands_free_rx.changed() => {
                let enabled = *self.hands_free_rx.borrow_and_update();
                self.on_hands_free_changed(enabled).await;
                true
            }
        };

        self.drain_engine_events().await;
        keep_running
    }

    /// Drive the pipeline until a `Shutdown` command arrives.
    pub async fn run(mut self) {
        info!("🔄 voice pipeline loop started");
        while self.step().await {}
        info!("voice pipeline loop ended");
    }

    /// Run on the current tokio runtime.
    pub fn spawn(self) -> (PipelineHandle, JoinHandle<()>) {
        let handle = self.handle();
        let task = tokio::spawn(self.run());
        (handle, task)
    }

    async fn handle_command(&mut self, command: PipelineCommand) -> bool {
        debug!(?command, "pipeline command");
        match command {
            PipelineCommand::Start => self.start().await,
            PipelineCommand::Stop => self.stop(),
            PipelineCommand::ActivateManually => {
                if let Err(e) = self.activate_manually().await {
                    warn!("{}", e);
                    self.broadcast(PipelineEvent::Error(e.to_string()));
                }
            }
            PipelineCommand::SubmitText(text) => {
                self.submit_text(&text).await;
            }
            PipelineCommand::SetSpeechOutput(enabled) => self.set_speech_output(enabled),
            PipelineCommand::SetHandsFree(enabled) => {
                let result = if enabled {
                    self.hands_free.enable()
                } else {
                    self.hands_free.disable()
                };
                if let Err(e) = result {
                    warn!("hands-free preference not saved: {}", e);
                    self.broadcast(PipelineEvent::Error(e.to_string()));
                }
                let enabled = self.hands_free.is_enabled();
                self.on_hands_free_changed(enabled).await;
            }
            PipelineCommand::SetContext(context) => self.set_context(context),
            PipelineCommand::Shutdown => {
                self.stop();
                return false;
            }
        }
        true
    }

    async fn drain_engine_events(&mut self) {
        loop {
            if let Ok(event) = self.mic_rx.try_recv() {
                self.on_mic_event(event);
                continue;
            }
            if let Ok(event) = self.wake_rx.try_recv() {
                self.on_wake_event(event).await;
                continue;
            }
            if let Ok(event) = self.stt_rx.try_recv() {
                self.on_stt_event(event).await;
                continue;
            }
            if let Ok(event) = self.turn_rx.try_recv() {
                self.on_turn_event(event).await;
                continue;
            }
            break;
        }
    }

    fn on_mic_event(&mut self, event: MicEvent) {
        match event {
            MicEvent::StateChanged(state) => debug!(?state, "mic"),
            MicEvent::Silence { duration } => {
                if self.state == PipelineState::Listening {
                    debug!(?duration, "mic silence closes the turn");
                    self.stt.end_speech();
                }
            }
            MicEvent::Error(e) => {
                if self.state.in_turn() {
                    self.enter_error(e);
                } else {
                    debug!("mic error outside a turn: {}", e);
                }
            }
        }
    }

    async fn on_wake_event(&mut self, event: WakeEvent) {
        match event {
            WakeEvent::Detected(detection) => {
                if self.state != PipelineState::WakeListening {
                    return;
                }
                self.broadcast(PipelineEvent::WakeWord {
                    phrase: detection.phrase.clone(),
                    query: detection.query.clone(),
                });
                self.activate(&detection.transcript, detection.query).await;
            }
            WakeEvent::StatusChanged(status) => debug!(?status, "wake word"),
            WakeEvent::Error(e) => {
                if self.state != PipelineState::Error {
                    self.enter_error(e);
                }
            }
        }
    }

    async fn on_stt_event(&mut self, event: SttEvent) {
        match event {
            SttEvent::Started => debug!("turn recognition started"),
            SttEvent::Partial(partial) => self.broadcast(PipelineEvent::Transcript {
                text: partial.text,
                is_final: false,
            }),
            SttEvent::Final(transcript) => self.broadcast(PipelineEvent::Transcript {
                text: transcript.text,
                is_final: true,
            }),
            SttEvent::EarlyIntent { kind, transcript } => {
                debug!(intent = %kind, transcript = %transcript, "early intent");
            }
            SttEvent::SpeechEnd { transcript } => {
                if self.state == PipelineState::Listening {
                    self.finish_turn(transcript).await;
                }
            }
            SttEvent::Interrupted => self.on_interrupted().await,
            SttEvent::Error(e) => {
                if self.state.in_turn() {
                    self.enter_error(e);
                }
            }
        }
    }

    async fn on_turn_event(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::Interruption { .. } => self.on_interrupted().await,
            other => debug!(?other, "turn"),
        }
    }

    fn on_frame(&mut self, frame: AudioFrame) {
        let level = self.mic.process_frame(&frame);
        self.broadcast(PipelineEvent::Volume(level));
        if self.state == PipelineState::Speaking && self.config.pipeline.barge_in {
            self.stt.on_audio_level(level);
        }
    }

    async fn on_synthesis(&mut self, event: SynthesisEvent) {
        match event {
            SynthesisEvent::Started => debug!("playback started"),
            SynthesisEvent::Ended => {
                if self.state == PipelineState::Speaking {
                    debug!("playback finished");
                    self.synthesis = None;
                    self.turns.end_system_turn();
                    self.enter_rest().await;
                }
            }
            SynthesisEvent::Error(message) => {
                warn!("playback failed: {}", message);
                self.broadcast(PipelineEvent::Error(
                    VoiceError::Synthesis(message).to_string(),
                ));
                if self.state == PipelineState::Speaking {
                    self.synthesis = None;
                    self.turns.end_system_turn();
                    self.enter_rest().await;
                }
            }
        }
    }

    async fn on_settled(&mut self) {
        self.settle_deadline = None;
        if self.state == PipelineState::Activated {
            self.start_active_listening().await;
        }
    }

    async fn on_hands_free_changed(&mut self, enabled: bool) {
        let should_move = match self.state {
            PipelineState::Idle => enabled && self.started,
            PipelineState::WakeListening => !enabled,
            _ => false,
        };
        if should_move {
            self.enter_rest().await;
        }
    }

    async fn on_interrupted(&mut self) {
        if self.state != PipelineState::Speaking {
            return;
        }
        info!("⚡ user barged in");
        self.synthesis = None;
        self.broadcast(PipelineEvent::Interrupted);
        self.start_active_listening().await;
    }

    /// Wake trigger (spoken or manual): tear down wake listening, open the
    /// microphone and schedule the listening turn.
    async fn activate(&mut self, trigger: &str, seed: Option<String>) {
        self.bus.publish(IntentKind::WakeWord, trigger);
        self.wake.disable();
        self.broadcast(PipelineEvent::ActivationCue);
        self.set_state(PipelineState::Activated);

        if self.mic.start_listening().await.is_none() {
            // The mic error event moves us to `error` when drained.
            return;
        }
        self.pending_seed = seed;
        self.settle_deadline = Some(Instant::now() + self.config.pipeline.settle_delay());
    }

    async fn start_active_listening(&mut self) {
        self.wake.disable();
        if !self.stt.start().await {
            return;
        }
        if let Some(seed) = self.pending_seed.take() {
            self.stt.seed(&seed);
        }
        self.mic.rearm_silence();
        self.turns.begin_user_turn();
        self.set_state(PipelineState::Listening);
    }

    async fn finish_turn(&mut self, transcript: String) {
        self.turns.end_user_turn();
        self.stt.stop();

        let text = transcript.trim();
        if text.is_empty() {
            debug!("empty turn");
            self.enter_rest().await;
            return;
        }

        self.broadcast(PipelineEvent::UserUtterance(text.to_string()));
        self.set_state(PipelineState::Processing);
        let (reply, selection) = self.compose_reply(text);

        if self.speech_output {
            self.speak(&reply, &selection.profile);
        } else {
            self.enter_rest().await;
        }
    }

    fn compose_reply(&mut self, text: &str) -> (String, ToneSelection) {
        let selection = self.tone.select_tone(text, None, Some(&self.context));
        let reply = self.responder.respond(text, &self.context);

        self.context.recent_turns.push(text.to_string());
        if self.context.recent_turns.len() > RECENT_TURNS {
            let excess = self.context.recent_turns.len() - RECENT_TURNS;
            self.context.recent_turns.drain(..excess);
        }

        info!(tone = %selection.tone, reason = %selection.reason, "💬 reply ready");
        self.broadcast(PipelineEvent::Reply {
            text: reply.clone(),
            tone: selection.tone,
        });
        (reply, selection)
    }

    /// Start synthesizing on a separate task. The pipeline stays in
    /// `processing` until [`Self::on_speech_ready`] sees the session.
    fn speak(&mut self, reply: &str, profile: &ToneProfile) {
        if !self.config.pipeline.barge_in {
            self.mic.stop_listening();
        }
        let synthesizer = Arc::clone(&self.synthesizer);
        let text = reply.to_string();
        let profile = profile.clone();
        let task = tokio::spawn(async move { synthesizer.speak(&text, &profile).await });
        if let Some(previous) = self.speech_task.replace(task) {
            previous.abort();
        }
    }

    async fn on_speech_ready(&mut self, result: VoiceResult<SynthesisSession>) {
        if self.state != PipelineState::Processing {
            if result.is_ok() {
                self.synthesizer.cancel();
            }
            return;
        }
        match result {
            Ok(session) => {
                self.synthesis = Some(session);
                self.turns.begin_system_turn();
                self.set_state(PipelineState::Speaking);
            }
            Err(e) => {
                warn!("speech synthesis failed: {}", e);
                self.broadcast(PipelineEvent::Error(e.to_string()));
                self.enter_rest().await;
            }
        }
    }

    /// Abort a running synthesis request and silence any playback.
    fn cancel_speech(&mut self) {
        let fetching = match self.speech_task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        };
        if self.synthesis.take().is_some() || fetching {
            self.synthesizer.cancel();
        }
    }

    async fn enter_rest(&mut self) {
        self.teardown();
        if self.hands_free.is_enabled() && self.wake.enable().await {
            self.set_state(PipelineState::WakeListening);
        } else {
            self.set_state(PipelineState::Idle);
        }
    }

    fn enter_error(&mut self, err: VoiceError) {
        error!("voice pipeline error: {}", err);
        self.last_error = Some(err.to_string());
        self.teardown();
        self.broadcast(PipelineEvent::Error(err.to_string()));
        self.set_state(PipelineState::Error);
    }

    /// Release every engine resource. Leaves `state` alone.
    fn teardown(&mut self) {
        self.settle_deadline = None;
        self.pending_seed = None;
        self.wake.disable();
        self.stt.stop();
        self.cancel_speech();
        self.turns.reset();
        self.mic.stop_listening();
    }

    fn set_state(&mut self, to: PipelineState) {
        let from = self.state;
        if from == to {
            return;
        }
        info!(from = %from, to = %to, "pipeline state");
        self.state = to;

        if let Err(e) = self.hands_free.set_active(to == PipelineState::WakeListening) {
            warn!("hands-free stats not saved: {}", e);
        }
        self.broadcast(PipelineEvent::StateChanged { from, to });
    }

    fn broadcast(&self, event: PipelineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Drop for VoicePipeline {
    fn drop(&mut self) {
        self.teardown();
    }
}

static DEFAULT_PIPELINE: Lazy<Mutex<Option<PipelineHandle>>> = Lazy::new(|| Mutex::new(None));

/// Register a process-wide pipeline handle. Returns the one it replaced.
pub fn install_default(handle: PipelineHandle) -> Option<PipelineHandle> {
    DEFAULT_PIPELINE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(handle)
}

pub fn default_pipeline() -> Option<PipelineHandle> {
    DEFAULT_PIPELINE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Remove the default handle and shut its pipeline down.
pub fn teardown_default() -> bool {
    let handle = DEFAULT_PIPELINE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    match handle {
        Some(handle) => {
            if let Err(e) = handle.shutdown() {
                debug!("default pipeline already gone: {}", e);
            }
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ScriptedCapture;
    use crate::preferences::MemoryPreferenceStore;
    use crate::recognition::ScriptedRecognizer;
    use crate::responder::CannedResponder;
    use crate::synthesis::PlaceholderSynthesizer;
    use std::time::Duration;

    fn pipeline(speech_output: bool) -> (VoicePipeline, PlaceholderSynthesizer) {
        let synth = PlaceholderSynthesizer::new();
        let hands_free =
            Arc::new(HandsFreeModeManager::new(Arc::new(MemoryPreferenceStore::new())).unwrap());
        let mut config = VoiceConfig::default();
        config.pipeline.speech_output = speech_output;
        let p = VoicePipeline::new(
            config,
            PipelineDeps {
                capture: Arc::new(ScriptedCapture::new()),
                recognizer: Arc::new(ScriptedRecognizer::new()),
                synthesizer: Arc::new(synth.clone()),
                responder: Arc::new(CannedResponder::default()),
                hands_free,
                bus: EventBus::new(),
            },
        );
        (p, synth)
    }

    #[test]
    fn state_names() {
        assert_eq!(PipelineState::WakeListening.to_string(), "wake_listening");
        assert_eq!(PipelineState::Error.as_str(), "error");
    }

    #[tokio::test]
    async fn start_without_hands_free_stays_idle() {
        let (mut p, _synth) = pipeline(true);
        p.start().await;
        assert_eq!(p.state(), PipelineState::Idle);
    }

    #[tokio::test]
    async fn manual_activation_only_from_rest() {
        let (mut p, _synth) = pipeline(true);
        p.activate_manually().await.unwrap();
        assert_eq!(p.state(), PipelineState::Activated);

        let err = p.activate_manually().await.unwrap_err();
        assert!(matches!(err, VoiceError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn typed_text_without_speech_leaves_state_alone() {
        let (mut p, synth) = pipeline(false);
        let reply = p.submit_text("what is hydra").await.unwrap();
        assert!(reply.starts_with("Hydra"));
        assert_eq!(p.state(), PipelineState::Idle);
        assert!(synth.spoken().is_empty());
        assert_eq!(p.context().recent_turns, vec!["what is hydra".to_string()]);
    }

    #[tokio::test]
    async fn typed_text_with_speech_is_spoken() {
        let (mut p, synth) = pipeline(true);
        p.submit_text("I'm worried about my wallet").await.unwrap();
        assert_eq!(p.state(), PipelineState::Processing);
        assert!(p.step().await);
        assert_eq!(p.state(), PipelineState::Speaking);
        assert_eq!(synth.last_profile().unwrap().tone, ToneType::Calm);
    }

    #[tokio::test]
    async fn stop_from_any_state_returns_to_idle() {
        let (mut p, synth) = pipeline(true);
        p.submit_text("hello").await;
        assert!(p.step().await);
        assert_eq!(p.state(), PipelineState::Speaking);
        p.stop();
        assert_eq!(p.state(), PipelineState::Idle);
        assert_eq!(synth.cancelled_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_synthesizing_drops_the_reply() {
        let (mut p, synth) = pipeline(true);
        let synth = synth.with_latency(Duration::from_secs(30));
        p.submit_text("what is hydra").await;
        assert_eq!(p.state(), PipelineState::Processing);

        p.stop();
        assert_eq!(p.state(), PipelineState::Idle);
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(synth.spoken().is_empty());
        assert!(!synth.is_playing());
    }

    #[tokio::test]
    async fn default_handle_install_and_teardown() {
        let (p, _synth) = pipeline(true);
        assert!(install_default(p.handle()).is_none());
        assert!(default_pipeline().is_some());
        assert!(teardown_default());
        assert!(default_pipeline().is_none());
        assert!(!teardown_default());
    }
}
