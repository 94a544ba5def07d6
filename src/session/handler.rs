//! Per-connection session orchestration.
//!
//! A running session is four cooperating tasks: inbound frame processing,
//! outbound emission, pipeline supervision, and a low-rate diagnostic
//! logger. The first failure cancels all of them; cleanup runs exactly
//! once no matter which path ended the session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt, pin_mut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::audio::{OpusStreamDecoder, OpusStreamEncoder, has_stream_start};
use crate::characters::CharacterRegistry;
use crate::chat::prompt::{
    ConstantPrompt, Instructions, PromptGenerator, TemplatePrompt, ToolSupport,
    default_system_prompt,
};
use crate::chat::{Chatbot, ConversationState, DeltaRole, INTERRUPTION_MARKER, USER_SILENCE_MARKER};
use crate::config::ServerConfig;
use crate::errors::{SessionError, SessionResult};
use crate::events::{
    ClientEvent, ResponsePayload, ServerEvent, SessionConfig, parse_client_event, random_id,
};
use crate::llm::{ApiMessage, ChatClient, CompletionRequest, rechunk_to_words};
use crate::metrics;
use crate::services::{SpeechToText, SttEvent, SttSender, TextToSpeech, TtsEvent};
use crate::state::AppState;

use super::recorder::EventRecorder;
use super::supervisor::{TaskGroup, TaskWaiter};
use super::OutboundItem;

/// Queue depths for the explicit and producer paths.
const CHANNEL_BUFFER_SIZE: usize = 256;

/// How often the diagnostic task logs session state.
const DIAGNOSTIC_INTERVAL: Duration = Duration::from_secs(5);

/// User silence long enough to hand the model the silence marker.
const SILENCE_PROMPT_AFTER: Duration = Duration::from_secs(12);

type WsSender = Arc<tokio::sync::Mutex<SplitSink<WebSocket, Message>>>;

struct ActiveResponse {
    handle: AbortHandle,
    /// The turn's TTS audio pump, registered once the turn spawns it.
    audio: Option<AbortHandle>,
    id: u64,
}

/// State shared by a session's tasks.
struct SessionContext {
    id: String,
    config: Arc<ServerConfig>,
    chat: Arc<ChatClient>,
    characters: CharacterRegistry,
    chatbot: Mutex<Chatbot>,
    session_config: Mutex<SessionConfig>,
    recorder: Mutex<Option<Arc<EventRecorder>>>,
    response: Mutex<Option<ActiveResponse>>,
    response_seq: AtomicU64,
    tasks: TaskGroup,
    /// Explicit queue: drained with priority by the emit loop.
    emit_tx: mpsc::Sender<OutboundItem>,
    /// Producer queue: pipeline events and PCM.
    outbound_tx: mpsc::Sender<OutboundItem>,
}

impl SessionContext {
    /// Queue an explicit event (acks, protocol errors, reload results).
    async fn emit(&self, event: ServerEvent) -> SessionResult<()> {
        self.emit_tx
            .send(OutboundItem::Event(event))
            .await
            .map_err(|_| SessionError::Internal(anyhow::anyhow!("emit queue closed")))
    }

    /// Queue a producer-side item (pipeline events, PCM).
    async fn produce(&self, item: OutboundItem) -> SessionResult<()> {
        self.outbound_tx
            .send(item)
            .await
            .map_err(|_| SessionError::Internal(anyhow::anyhow!("producer queue closed")))
    }

    fn recording_enabled(&self) -> bool {
        self.session_config.lock().allow_recording
    }

    async fn record_client(&self, payload: serde_json::Value) {
        if !self.recording_enabled() {
            return;
        }
        let recorder = self.recorder.lock().clone();
        if let Some(recorder) = recorder {
            recorder.record("client", &payload).await;
        }
    }

    async fn record_server(&self, event: &ServerEvent) {
        if !self.recording_enabled() {
            return;
        }
        let recorder = self.recorder.lock().clone();
        if let Some(recorder) = recorder {
            if let Ok(payload) = serde_json::to_value(event) {
                recorder.record("server", &payload).await;
            }
        }
    }

    /// Apply a `session.update`: the stored configuration is replaced
    /// wholesale, never merged.
    async fn apply_session_update(self: &Arc<Self>, session: SessionConfig) -> SessionResult<()> {
        if session.allow_recording {
            self.ensure_recorder().await;
        }
        *self.session_config.lock() = session.clone();

        let mut errors: Vec<ServerEvent> = Vec::new();
        let mut greet = false;

        if let Some(voice) = &session.voice {
            match self.characters.get(voice) {
                Some(character) => {
                    let generator = character.prompt_generator();
                    // Rendered exactly once per character selection; a
                    // re-switch keeps the previously frozen prompt.
                    let prompt = generator.make_system_prompt();
                    let mut chatbot = self.chatbot.lock();
                    chatbot.switch_character(&character.name, &prompt);
                    chatbot.retain_prompt_generator(generator);
                    greet = chatbot.message_count() <= 1;
                }
                None => {
                    warn!(voice, "Requested voice is not in the character roster");
                    errors.push(ServerEvent::invalid_request(
                        format!("Unknown voice: {voice}"),
                        None,
                    ));
                }
            }
        }

        if let Some(instructions) = &session.instructions {
            match build_generator(instructions) {
                Ok(generator) => self.chatbot.lock().set_prompt_generator(generator),
                Err(message) => {
                    errors.push(ServerEvent::invalid_request(message, None));
                }
            }
        }

        for event in errors {
            self.emit(event).await?;
        }

        if greet {
            // Fresh character, nothing said yet: the bot opens the
            // conversation.
            self.start_response();
        }
        Ok(())
    }

    async fn ensure_recorder(&self) {
        if self.recorder.lock().is_some() {
            return;
        }
        let Some(directory) = self.config.recordings_dir.clone() else {
            return;
        };
        match EventRecorder::create(&directory, &self.id).await {
            Ok(recorder) => {
                *self.recorder.lock() = Some(Arc::new(recorder));
                info!(session_id = self.id, "Event recording enabled");
            }
            Err(e) => warn!(error = %e, "Could not create event recorder"),
        }
    }

    /// Handle one transcribed word from the STT.
    async fn on_user_word(self: &Arc<Self>, text: String, start_time: f64) -> SessionResult<()> {
        // Speech over a running generation interrupts it, stale audio
        // included.
        let interrupted = self.response.lock().take();
        if let Some(active) = interrupted {
            active.handle.abort();
            if let Some(audio) = active.audio {
                audio.abort();
            }
            metrics::INTERRUPTIONS.inc();
            self.chatbot
                .lock()
                .add_message_delta(INTERRUPTION_MARKER, DeltaRole::Assistant, None);
            self.produce(OutboundItem::Event(ServerEvent::InterruptedByVad))
                .await?;
        }

        let is_new = self
            .chatbot
            .lock()
            .add_message_delta(&text, DeltaRole::User, None);
        if is_new {
            self.produce(OutboundItem::Event(ServerEvent::SpeechStarted))
                .await?;
        }
        self.produce(OutboundItem::Event(ServerEvent::TranscriptionDelta {
            delta: text,
            start_time,
        }))
        .await
    }

    /// Handle an endpoint pause from the STT: the user turn is over.
    async fn on_user_pause(self: &Arc<Self>) -> SessionResult<()> {
        self.produce(OutboundItem::Event(ServerEvent::SpeechStopped))
            .await?;

        let should_respond = {
            self.response.lock().is_none()
                && self.chatbot.lock().conversation_state() == ConversationState::UserSpeaking
        };
        if should_respond {
            self.start_response();
        }
        Ok(())
    }

    /// Long silence mid-conversation: hand the model the silence marker so
    /// it can acknowledge the pause.
    async fn maybe_prompt_silence(self: &Arc<Self>) -> SessionResult<()> {
        {
            if self.response.lock().is_some() {
                return Ok(());
            }
            let chatbot = self.chatbot.lock();
            if chatbot.message_count() <= 1 {
                return Ok(());
            }
            if chatbot.conversation_state() == ConversationState::UserSpeaking {
                return Ok(());
            }
        }

        info!(session_id = self.id, "User has been silent, prompting model");
        self.chatbot
            .lock()
            .add_message_delta(USER_SILENCE_MARKER, DeltaRole::User, None);
        self.start_response();
        Ok(())
    }

    /// Spawn one response turn. The slot is written under the lock before
    /// the task can observe it, so the task's own cleanup cannot race the
    /// store.
    fn start_response(self: &Arc<Self>) {
        let mut slot = self.response.lock();
        if slot.is_some() {
            debug!("Response already in flight, not starting another");
            return;
        }

        let id = self.response_seq.fetch_add(1, Ordering::Relaxed);
        let ctx = self.clone();
        let handle = self.tasks.spawn("response", async move {
            let result = generate_response(ctx.clone()).await;
            let mut slot = ctx.response.lock();
            if slot.as_ref().map(|r| r.id) == Some(id) {
                *slot = None;
            }
            result
        });
        *slot = Some(ActiveResponse {
            handle,
            audio: None,
            id,
        });
    }
}

fn build_generator(instructions: &Instructions) -> Result<Arc<dyn PromptGenerator>, String> {
    match instructions {
        Instructions::Constant { text } => Ok(Arc::new(ConstantPrompt { text: text.clone() })),
        Instructions::Template { language, extra } => Ok(Arc::new(TemplatePrompt {
            language: *language,
            extra: extra.clone(),
        })),
        Instructions::Generator { id } => crate::characters::builtin::generator(id)
            .ok_or_else(|| format!("Unknown prompt generator: {id}")),
    }
}

// =============================================================================
// Entry point
// =============================================================================

/// Run one realtime session to completion.
pub async fn run_session(socket: WebSocket, state: Arc<AppState>) {
    // Admission: a bounded gate on concurrently running sessions. We scale
    // by running more processes, not by raising this ceiling.
    let Ok(_permit) = state.admission.clone().acquire_owned().await else {
        return;
    };

    metrics::SESSIONS.inc();
    metrics::ACTIVE_SESSIONS.inc();
    let session_started = Instant::now();

    run_accepted_session(socket, state).await;

    metrics::ACTIVE_SESSIONS.dec();
    metrics::SESSION_DURATION.observe(session_started.elapsed().as_secs_f64());
}

async fn run_accepted_session(socket: WebSocket, state: Arc<AppState>) {
    let session_id = random_id("sess");
    info!(session_id, "Realtime session started");

    let (sender, receiver) = socket.split();
    let sender: WsSender = Arc::new(tokio::sync::Mutex::new(sender));

    // Health gate: refuse before admitting any traffic. Voice cloning is
    // probed but never blocks.
    let health = state.health.check().await;
    if !health.ok {
        info!(session_id, ?health, "Health check failed, refusing session");
        send_and_close(
            &sender,
            ServerEvent::fatal("Server is not healthy. Please try again later."),
        )
        .await;
        return;
    }

    let (emit_tx, emit_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
    let (tasks, mut waiter) = TaskGroup::new();

    let ctx = Arc::new(SessionContext {
        id: session_id.clone(),
        config: state.config.clone(),
        chat: state.chat.clone(),
        characters: CharacterRegistry::new(),
        chatbot: Mutex::new(Chatbot::new()),
        session_config: Mutex::new(SessionConfig {
            instructions: None,
            voice: None,
            allow_recording: false,
        }),
        recorder: Mutex::new(None),
        response: Mutex::new(None),
        response_seq: AtomicU64::new(0),
        tasks,
        emit_tx: emit_tx.clone(),
        outbound_tx,
    });

    state.sessions.register(session_id.clone(), emit_tx);

    // Session-scoped character roster; other sessions are unaffected by
    // whatever this one loads later.
    if let Err(e) = ctx.characters.load(&state.config.characters_dir).await {
        warn!(session_id, error = %e, "Starting with an empty character roster");
    }

    // A default persona until the client picks a voice, so early
    // transcripts have somewhere to go.
    ctx.chatbot
        .lock()
        .switch_character("default", &default_system_prompt());

    let result = match SpeechToText::connect(&state.config.stt_url).await {
        Ok(stt) => {
            let pcm_tx = stt.pcm_sender();
            let stt_ctx = ctx.clone();
            ctx.tasks
                .spawn("stt_pump", async move { stt_pump(stt, stt_ctx).await });

            drive_session(receiver, sender.clone(), ctx.clone(), emit_rx, outbound_rx, &mut waiter, pcm_tx)
                .await
        }
        Err(e) => Err(e),
    };

    ctx.tasks.abort_all();

    // Classified exactly once, at the task-group boundary.
    match &result {
        Ok(()) => info!(session_id, "Session closed normally"),
        Err(SessionError::TransportClosed) => {
            debug!(session_id, "Websocket closed by client");
        }
        Err(SessionError::ServiceAtCapacity(service)) => {
            metrics::FATAL_SERVICE_MISSES.inc();
            metrics::FORCE_DISCONNECTS.inc();
            send_and_close(
                &sender,
                ServerEvent::fatal(format!(
                    "Too many people are connected to service '{service}'. Please try again later."
                )),
            )
            .await;
        }
        Err(SessionError::ServiceTimeout(service)) => {
            metrics::FATAL_SERVICE_MISSES.inc();
            metrics::FORCE_DISCONNECTS.inc();
            send_and_close(
                &sender,
                ServerEvent::fatal(format!(
                    "Service '{service}' timed out. Please try again later."
                )),
            )
            .await;
        }
        Err(err) => {
            // Full detail stays server-side; the wire gets a generic
            // message.
            metrics::HARD_ERRORS.inc();
            metrics::FORCE_DISCONNECTS.inc();
            error!(session_id, error = %err, "Unclassified session error");
            send_and_close(&sender, ServerEvent::fatal("Internal server error.")).await;
        }
    }

    // Cleanup runs exactly once, on every path.
    state.sessions.deregister(&session_id);
    ctx.chatbot.lock().clear_all();
    info!(session_id, "Session cleanup complete");
}

async fn drive_session(
    receiver: SplitStream<WebSocket>,
    sender: WsSender,
    ctx: Arc<SessionContext>,
    emit_rx: mpsc::Receiver<OutboundItem>,
    outbound_rx: mpsc::Receiver<OutboundItem>,
    waiter: &mut TaskWaiter,
    pcm_tx: SttSender,
) -> SessionResult<()> {
    let receive = receive_loop(receiver, ctx.clone(), pcm_tx);
    let emit = emit_loop(sender, ctx.clone(), emit_rx, outbound_rx);
    let diagnostic = diagnostic_loop(ctx.clone());

    // Four tasks supervised as a unit: first completion/failure wins and
    // the rest are dropped or aborted by the caller.
    tokio::select! {
        result = receive => result,
        result = emit => result,
        error = waiter.wait() => Err(error),
        result = diagnostic => result,
    }
}

async fn send_and_close(sender: &WsSender, event: ServerEvent) {
    let mut sender = sender.lock().await;
    match event.to_wire() {
        Ok(wire) => {
            if sender.send(Message::Text(wire.into())).await.is_err() {
                debug!("Could not deliver final event, socket already closed");
            }
        }
        Err(e) => error!(error = %e, "Failed to serialize final event"),
    }
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: 1011,
            reason: "session ended".into(),
        })))
        .await;
}

// =============================================================================
// Inbound
// =============================================================================

async fn receive_loop(
    mut receiver: SplitStream<WebSocket>,
    ctx: Arc<SessionContext>,
    pcm_tx: SttSender,
) -> SessionResult<()> {
    let decoder = Arc::new(Mutex::new(OpusStreamDecoder::new()?));
    // Reconnecting clients can flush stale audio from a reused buffer;
    // nothing is decoded until a page carrying the stream-start flag.
    let mut wait_for_stream_start = true;

    loop {
        let message = match receiver.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(error = %e, "Receive failed, client is gone");
                return Err(SessionError::TransportClosed);
            }
            None => return Err(SessionError::TransportClosed),
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return Err(SessionError::TransportClosed),
            _ => continue,
        };

        let event = match parse_client_event(&text) {
            Ok(event) => event,
            Err(error_event) => {
                metrics::INVALID_FRAMES.inc();
                // Protocol errors are local to one frame; the session
                // continues.
                ctx.emit(error_event).await?;
                continue;
            }
        };

        match event {
            ClientEvent::SessionUpdate { session } => {
                ctx.apply_session_update(session.clone()).await?;
                ctx.record_client(serde_json::json!({
                    "type": "session.update",
                    "session": &session,
                }))
                .await;
                ctx.emit(ServerEvent::SessionUpdated { session }).await?;
            }

            ClientEvent::InputAudioBufferAppend { audio } => {
                let bytes = match BASE64.decode(audio.as_bytes()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        metrics::INVALID_FRAMES.inc();
                        ctx.emit(ServerEvent::invalid_request(
                            format!("Invalid base64 audio: {e}"),
                            None,
                        ))
                        .await?;
                        continue;
                    }
                };

                if wait_for_stream_start {
                    if has_stream_start(&bytes) {
                        wait_for_stream_start = false;
                    } else {
                        continue;
                    }
                }

                // Codec work stays off the cooperative scheduler.
                let decoder = decoder.clone();
                let pcm = tokio::task::spawn_blocking(move || decoder.lock().append(&bytes))
                    .await
                    .map_err(|e| SessionError::Internal(e.into()))??;

                ctx.record_client(serde_json::json!({
                    "type": "gateway.input_audio_buffer.append_anonymized",
                    "number_of_samples": pcm.len(),
                }))
                .await;

                if !pcm.is_empty() {
                    pcm_tx.send_pcm(pcm).await?;
                }
            }

            ClientEvent::CharactersReload { directory } => {
                handle_characters_reload(&ctx, &directory).await?;
                ctx.record_client(serde_json::json!({
                    "type": "session.characters.reload",
                    "directory": directory,
                }))
                .await;
            }

            ClientEvent::CharactersList => {
                let directory = ctx
                    .characters
                    .current_directory()
                    .map(|d| d.display().to_string())
                    .unwrap_or_default();
                let characters = ctx.characters.infos();
                ctx.emit(ServerEvent::CharactersListed {
                    directory,
                    character_count: characters.len(),
                    characters,
                })
                .await?;
            }

            ClientEvent::InputAudioBufferAppendAnonymized { number_of_samples } => {
                // Exists for recording symmetry only; a real client has no
                // business sending it.
                debug!(number_of_samples, "Ignoring anonymized audio append");
            }

            ClientEvent::AdditionalOutputs { .. } => {
                // Informational and potentially verbose; not recorded.
                debug!("Ignoring additional-outputs event");
            }
        }
    }
}

async fn handle_characters_reload(ctx: &Arc<SessionContext>, directory: &str) -> SessionResult<()> {
    let resolved = ctx.config.resolve_characters_dir(directory);

    match ctx.characters.reload(&resolved).await {
        Ok(result) => {
            info!(
                session_id = ctx.id,
                directory = %resolved.display(),
                loaded = result.loaded_count,
                "Session characters reloaded"
            );
            let mut characters: Vec<_> =
                result.characters.values().map(|c| c.info()).collect();
            characters.sort_by(|a, b| a.name.cmp(&b.name));
            ctx.emit(ServerEvent::CharactersReloaded {
                directory: resolved.display().to_string(),
                total_files: result.total_files,
                loaded_count: result.loaded_count,
                error_count: result.error_count,
                characters,
            })
            .await
        }
        Err(e) => {
            warn!(session_id = ctx.id, error = %e, "Character reload failed");
            ctx.emit(ServerEvent::server_error(e.code(), e.to_string()))
                .await
        }
    }
}

// =============================================================================
// Outbound
// =============================================================================

async fn emit_loop(
    sender: WsSender,
    ctx: Arc<SessionContext>,
    mut emit_rx: mpsc::Receiver<OutboundItem>,
    mut outbound_rx: mpsc::Receiver<OutboundItem>,
) -> SessionResult<()> {
    let encoder = Arc::new(Mutex::new(OpusStreamEncoder::new()?));

    loop {
        // Explicit events always go out before polling the producers.
        let item = match emit_rx.try_recv() {
            Ok(item) => item,
            Err(TryRecvError::Disconnected) => {
                return Err(SessionError::Internal(anyhow::anyhow!("emit queue closed")));
            }
            Err(TryRecvError::Empty) => {
                let next = tokio::select! {
                    biased;
                    item = emit_rx.recv() => item,
                    item = outbound_rx.recv() => item,
                };
                next.ok_or_else(|| {
                    SessionError::Internal(anyhow::anyhow!("outbound queues closed"))
                })?
            }
        };

        match item {
            OutboundItem::Event(event) => {
                ctx.record_server(&event).await;
                send_event(&sender, &event).await?;
            }
            OutboundItem::Pcm(pcm) => {
                let encoder = encoder.clone();
                let bytes = tokio::task::spawn_blocking(move || encoder.lock().append_pcm(&pcm))
                    .await
                    .map_err(|e| SessionError::Internal(e.into()))??;
                // Codec framing may buffer: zero bytes is "nothing to emit
                // yet", not an error.
                if bytes.is_empty() {
                    continue;
                }
                let event = ServerEvent::ResponseAudioDelta {
                    delta: BASE64.encode(&bytes),
                };
                ctx.record_server(&event).await;
                send_event(&sender, &event).await?;
            }
            OutboundItem::Close => {
                info!(session_id = ctx.id, "Orderly close requested");
                let mut sender = sender.lock().await;
                let _ = sender.send(Message::Close(None)).await;
                // The receive loop observes the disconnect and unwinds.
                return Ok(());
            }
        }
    }
}

async fn send_event(sender: &WsSender, event: &ServerEvent) -> SessionResult<()> {
    let wire = event
        .to_wire()
        .map_err(|e| SessionError::Internal(e.into()))?;
    sender
        .lock()
        .await
        .send(Message::Text(wire.into()))
        .await
        .map_err(|_| SessionError::TransportClosed)
}

// =============================================================================
// Pipeline tasks
// =============================================================================

async fn stt_pump(mut stt: SpeechToText, ctx: Arc<SessionContext>) -> SessionResult<()> {
    let mut silence_deadline = tokio::time::Instant::now() + SILENCE_PROMPT_AFTER;

    loop {
        let event = tokio::select! {
            event = stt.next_event() => event,
            _ = tokio::time::sleep_until(silence_deadline) => {
                ctx.maybe_prompt_silence().await?;
                silence_deadline = tokio::time::Instant::now() + SILENCE_PROMPT_AFTER;
                continue;
            }
        };

        match event {
            SttEvent::Ready => debug!(session_id = ctx.id, "STT stream ready"),
            SttEvent::Word { text, start_time } => {
                silence_deadline = tokio::time::Instant::now() + SILENCE_PROMPT_AFTER;
                ctx.on_user_word(text, start_time).await?;
            }
            SttEvent::Pause => ctx.on_user_pause().await?,
            SttEvent::Error(message) => {
                return Err(SessionError::Upstream(format!("stt: {message}")));
            }
            SttEvent::Closed => {
                return Err(SessionError::Upstream("stt connection closed".to_string()));
            }
        }
    }
}

/// One response turn: completion stream in, text deltas and TTS audio out.
async fn generate_response(ctx: Arc<SessionContext>) -> SessionResult<()> {
    let (character, voice_label, history, messages) = {
        let chatbot = ctx.chatbot.lock();
        let name = chatbot.current_character().unwrap_or("default").to_string();
        (
            ctx.characters.get(&name),
            name,
            chatbot.current_messages(),
            chatbot.preprocessed_messages(),
        )
    };
    let voice_ref = character
        .as_ref()
        .map(|c| c.voice.reference().to_string())
        .unwrap_or_else(|| "default".to_string());

    ctx.produce(OutboundItem::Event(ServerEvent::ResponseCreated {
        response: ResponsePayload::in_progress(voice_label.clone(), history),
    }))
    .await?;

    // Tools fire only for characters that declare them and carry a
    // dispatcher.
    let (tools, dispatch, validators) = match &character {
        Some(c) => match c.prompt_generator().tool_support() {
            ToolSupport::Capable(dispatch) if !c.tools.is_empty() => {
                (c.tools.clone(), Some(dispatch), c.validators())
            }
            _ => (Vec::new(), None, Arc::new(Default::default())),
        },
        None => (Vec::new(), None, Arc::new(Default::default())),
    };

    let mut tts = TextToSpeech::connect(&ctx.config.tts_url, &voice_ref).await?;
    let tts_sender = tts.sender();

    let audio_ctx = ctx.clone();
    let pump_handle = ctx.tasks.spawn("tts_pump", async move {
        loop {
            match tts.next_event().await {
                TtsEvent::Audio(pcm) => audio_ctx.produce(OutboundItem::Pcm(pcm)).await?,
                TtsEvent::Done => {
                    audio_ctx
                        .produce(OutboundItem::Event(ServerEvent::ResponseAudioDone))
                        .await?;
                    return Ok(());
                }
                TtsEvent::Error(message) => {
                    return Err(SessionError::Upstream(format!("tts: {message}")));
                }
            }
        }
    });
    if let Some(active) = ctx.response.lock().as_mut() {
        active.audio = Some(pump_handle);
    }

    let request = CompletionRequest {
        messages: ApiMessage::from_history(&messages),
        tools,
        dispatch,
        validators,
        character_name: voice_label,
    };
    let words = rechunk_to_words(ctx.chat.clone().chat_completion(request));
    pin_mut!(words);

    // The producer tracks its own message index; a history that moved on
    // makes the delta stale and the append is rejected.
    let mut expected_index = ctx.chatbot.lock().message_count();
    let mut full_text = String::new();

    while let Some(word) = words.next().await {
        let word = word?;
        let is_new = ctx
            .chatbot
            .lock()
            .add_message_delta(&word, DeltaRole::Assistant, Some(expected_index));
        if is_new {
            expected_index += 1;
        }
        full_text.push_str(&word);
        ctx.produce(OutboundItem::Event(ServerEvent::ResponseTextDelta {
            delta: word.clone(),
        }))
        .await?;
        tts_sender.send_word(word).await?;
    }

    tts_sender.flush().await?;
    ctx.produce(OutboundItem::Event(ServerEvent::ResponseTextDone {
        text: full_text.trim_start().to_string(),
    }))
    .await?;

    Ok(())
}

async fn diagnostic_loop(ctx: Arc<SessionContext>) -> SessionResult<()> {
    let mut interval = tokio::time::interval(DIAGNOSTIC_INTERVAL);
    loop {
        interval.tick().await;
        let (state, messages, character) = {
            let chatbot = ctx.chatbot.lock();
            (
                chatbot.conversation_state(),
                chatbot.message_count(),
                chatbot.current_character().map(str::to_string),
            )
        };
        debug!(
            session_id = ctx.id,
            ?state,
            messages,
            character,
            characters_loaded = ctx.characters.len(),
            response_active = ctx.response.lock().is_some(),
            "Session diagnostic"
        );
    }
}
