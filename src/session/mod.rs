//! Call Session (C6): the state machine and single-writer-task
//! discipline for one telephone call. Grounded on the teacher's
//! `server/device.rs` (one task owns the outbound sink, producers go
//! through a channel, `tokio::select!` detects disconnect) and
//! `server/realtime_voice.rs` (`SessionState`, the echo-cooldown/
//! interrupt handling this module's barge-in wiring generalizes).

use crate::carrier::CarrierClient;
use crate::codec;
use crate::config::Config;
use crate::error::{BridgeError, HangupError, MediaError, MediaErrorKind, TimeoutError};
use crate::speech::events::Role as SpeechRole;
use crate::speech::{SpeechAgentConfig, SpeechCallbacks, SpeechSession};
use crate::splitbrain::retry::RetryPolicy;
use crate::splitbrain::SplitPipeline;
use crate::tools::ToolConfig;
use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

const MEDIA_QUEUE_CAPACITY: usize = 100;
const CONTROL_QUEUE_CAPACITY: usize = 16;
const FRAME_PACE_MS: u64 = 20;
const POLL_INTERVAL_MS: u64 = 50;
const UNIFIED_DRAIN_MS: u64 = 3_000;
const SPLIT_DRAIN_MS: u64 = 2_000;

macro_rules! newtype_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

newtype_id!(CallId);
newtype_id!(CarrierCallRef);
newtype_id!(WsToken);

impl CallId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Agent,
    User,
}

#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// The state machine in spec.md §3. Illegal transitions return
/// `IllegalTransition` rather than panicking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    New,
    Placing,
    Ringing,
    ConnectingMedia,
    Ready,
    SpeakingAgent,
    ListeningUser,
    ToolCall,
    Ending,
    Ended,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    Place,
    CarrierRinging,
    CarrierAnswered,
    MediaAndAgentReady,
    EnterSpeaking,
    EnterListening,
    EnterToolCall,
    ReturnToReady,
    BeginEnding,
    DrainComplete,
    Fail,
}

#[derive(Debug, thiserror::Error)]
#[error("illegal transition from {from:?} via {event:?}")]
pub struct IllegalTransition {
    pub from: CallState,
    pub event: CallEvent,
}

impl CallState {
    fn transition(self, event: CallEvent) -> Result<CallState, IllegalTransition> {
        use CallEvent::*;
        use CallState::*;
        let next = match (self, event) {
            (New, Place) => Placing,
            (Placing, CarrierRinging) => Ringing,
            (Placing, CarrierAnswered) => ConnectingMedia,
            (Ringing, CarrierAnswered) => ConnectingMedia,
            (ConnectingMedia, MediaAndAgentReady) => Ready,
            (Ready, EnterSpeaking) => SpeakingAgent,
            (SpeakingAgent, ReturnToReady) => Ready,
            (SpeakingAgent, EnterListening) => ListeningUser,
            (Ready, EnterListening) => ListeningUser,
            (ListeningUser, ReturnToReady) => Ready,
            (ListeningUser, EnterToolCall) => ToolCall,
            (SpeakingAgent, EnterToolCall) => ToolCall,
            (ToolCall, ReturnToReady) => Ready,
            (Placing, Fail) => Failed,
            (Ringing, Fail) => Failed,
            (ConnectingMedia, Fail) => Failed,
            (Failed, BeginEnding) => Ending,
            (_, BeginEnding) => Ending,
            (Ending, DrainComplete) => Ended,
            (Failed, DrainComplete) => Ended,
            (s, e) => return Err(IllegalTransition { from: s, event: e }),
        };
        Ok(next)
    }

    /// I4: `continue`, `speak`, `end` require READY or a substate.
    pub fn is_ready_or_substate(self) -> bool {
        matches!(
            self,
            CallState::Ready | CallState::SpeakingAgent | CallState::ListeningUser | CallState::ToolCall
        )
    }
}

#[derive(Clone)]
enum Backend {
    Unified(Arc<SpeechSession>),
    Split(Arc<SplitPipeline>),
}

enum MediaFrame {
    Audio { stream_sid: String, mulaw: Vec<u8> },
    Clear { stream_sid: String },
}

struct Inner {
    state: CallState,
    carrier_call_ref: Option<CarrierCallRef>,
    media_stream_id: Option<String>,
    stream_ready: bool,
    transcript: Vec<TranscriptEntry>,
    hung_up: bool,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    pending_turn: Option<String>,
    backend: Option<Backend>,
    media_sink_attached: bool,
}

/// Owns one `CallSession`. Public operations mirror spec.md §4.6:
/// `start`, `inject`, `speak`, `end`, `wait_for_user_turn`. Outbound
/// carrier frames funnel through one writer task fed by two queues —
/// control (`clear`) and audio — mirroring the priority discipline
/// C4's speech-agent writer already applies to its own two outbound
/// queues (spec.md §4.4/§9): control is always polled first, so a
/// `Clear` is never stuck behind a backlog of already-queued agent
/// audio.
pub struct CallSession {
    pub call_id: CallId,
    pub user_number: String,
    pub caller_number: String,
    pub ws_token: WsToken,
    inner: Mutex<Inner>,
    carrier: Arc<dyn CarrierClient>,
    tools: Arc<ToolConfig>,
    config: Arc<Config>,
    control_tx: mpsc::Sender<MediaFrame>,
    control_rx: Mutex<Option<mpsc::Receiver<MediaFrame>>>,
    audio_tx: mpsc::Sender<MediaFrame>,
    audio_rx: Mutex<Option<mpsc::Receiver<MediaFrame>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes `inject`/`speak`/`end`: at most one Driver RPC
    /// executes against this session at a time (spec.md §5).
    op_lock: Mutex<()>,
}

impl CallSession {
    pub fn new(
        user_number: String,
        caller_number: String,
        carrier: Arc<dyn CarrierClient>,
        tools: Arc<ToolConfig>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
        let (audio_tx, audio_rx) = mpsc::channel(MEDIA_QUEUE_CAPACITY);
        Arc::new(Self {
            call_id: CallId::new(),
            user_number,
            caller_number,
            ws_token: WsToken(crate::auth::new_ws_token()),
            inner: Mutex::new(Inner {
                state: CallState::New,
                carrier_call_ref: None,
                media_stream_id: None,
                stream_ready: false,
                transcript: Vec::new(),
                hung_up: false,
                started_at: Utc::now(),
                ended_at: None,
                pending_turn: None,
                backend: None,
                media_sink_attached: false,
            }),
            carrier,
            tools,
            config,
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            audio_tx,
            audio_rx: Mutex::new(Some(audio_rx)),
            writer_task: Mutex::new(None),
            op_lock: Mutex::new(()),
        })
    }

    pub async fn state(&self) -> CallState {
        self.inner.lock().await.state
    }

    pub async fn carrier_call_ref(&self) -> Option<CarrierCallRef> {
        self.inner.lock().await.carrier_call_ref.clone()
    }

    pub async fn is_hung_up(&self) -> bool {
        self.inner.lock().await.hung_up
    }

    async fn transition(&self, event: CallEvent) -> Result<(), IllegalTransition> {
        let mut inner = self.inner.lock().await;
        inner.state = inner.state.transition(event)?;
        Ok(())
    }

    /// Wire the carrier's media socket to this session's outbound
    /// writer task. Called once by the manager when `/media-stream`
    /// upgrades for this call's token (I2: non-null only between
    /// CONNECTING_MEDIA and ENDING).
    pub async fn attach_media_socket(self: &Arc<Self>, sink: SplitSink<WebSocket, WsMessage>) {
        let control_rx = self.control_rx.lock().await.take();
        let audio_rx = self.audio_rx.lock().await.take();
        let (control_rx, audio_rx) = match (control_rx, audio_rx) {
            (Some(c), Some(a)) => (c, a),
            _ => {
                tracing::warn!(call_id = %self.call_id, "media socket attached twice, ignoring");
                return;
            }
        };
        self.inner.lock().await.media_sink_attached = true;
        let call_id = self.call_id.clone();
        let handle = tokio::spawn(writer_loop(call_id, sink, control_rx, audio_rx));
        *self.writer_task.lock().await = Some(handle);
    }

    /// Captured from the carrier's first "start" frame.
    pub async fn set_media_stream_id(&self, stream_id: String) {
        self.inner.lock().await.media_stream_id = Some(stream_id);
    }

    pub async fn set_stream_ready(&self) {
        self.inner.lock().await.stream_ready = true;
    }

    /// Feed one chunk of inbound caller audio (already demuxed to the
    /// `inbound` track) into the connected backend. In split mode a
    /// completed utterance spawns the background "listen -> brain ->
    /// speak" turn (spec §4.6's conversation loop) rather than waiting
    /// for the Driver to drive it.
    pub async fn handle_inbound_audio(self: &Arc<Self>, mulaw: &[u8]) {
        let backend = self.inner.lock().await.backend.clone();
        match backend {
            Some(Backend::Unified(session)) => {
                let pcm8k = codec::mulaw_decode_buf(mulaw);
                let pcm16k = codec::upsample_8k_to_16k(&pcm8k);
                session.send_audio(&pcm16k).await;
            }
            Some(Backend::Split(pipeline)) => {
                if let Some(transcript) = pipeline.feed_inbound(mulaw).await {
                    self.record_turn(Speaker::User, transcript.clone()).await;
                    self.spawn_split_turn(pipeline, transcript);
                }
            }
            None => {}
        }
    }

    /// The split-brain analog of the unified model auto-responding to
    /// user speech: one "listen -> brain -> speak" turn, run off the
    /// inbound-audio task so reading the next chunk never blocks on a
    /// brain/TTS round trip. Coexists with Driver-initiated `inject`/
    /// `speak` because both paths funnel frames through the same
    /// single-writer outbound channel.
    fn spawn_split_turn(self: &Arc<Self>, pipeline: Arc<SplitPipeline>, user_text: String) {
        let session = self.clone();
        tokio::spawn(async move {
            session.transition(CallEvent::EnterSpeaking).await.ok();
            let retry = RetryPolicy::conversation_loop_default();
            let result = retry
                .run(|| {
                    let pipeline = pipeline.clone();
                    let user_text = user_text.clone();
                    let frame_session = session.clone();
                    async move {
                        pipeline
                            .speak(&user_text, move |frame| frame_session.enqueue_audio_frame_blocking(frame))
                            .await
                    }
                })
                .await;
            match result {
                Ok(reply) => session.record_turn(Speaker::Agent, reply).await,
                Err(e) => {
                    tracing::warn!(call_id = %session.call_id, error = %e, "split brain turn failed");
                }
            }
            session.transition(CallEvent::ReturnToReady).await.ok();
        });
    }

    /// Carrier webhook reported "ringing" (or equivalent).
    pub async fn on_carrier_ringing(&self) {
        if self.transition(CallEvent::CarrierRinging).await.is_err() {
            tracing::debug!(call_id = %self.call_id, "ignoring out-of-order ringing event");
        }
    }

    /// Carrier webhook reported "answered" (or equivalent). Unblocks
    /// `wait_for_media_ready`'s ConnectingMedia check.
    pub async fn on_carrier_answered(&self) {
        if self.transition(CallEvent::CarrierAnswered).await.is_err() {
            tracing::debug!(call_id = %self.call_id, "ignoring out-of-order answered event");
        }
    }

    /// Carrier-initiated hangup (webhook hangup event). Marks hung up
    /// immediately so every waiter unblocks within the polling
    /// granularity, then tears straight down to Ended -- there is
    /// nothing left to drain once the carrier has already dropped the
    /// leg.
    pub async fn on_carrier_hangup(&self) {
        self.mark_hung_up().await;
        self.transition(CallEvent::BeginEnding).await.ok();
        if let Some(handle) = self.writer_task.lock().await.take() {
            handle.abort();
        }
        let mut inner = self.inner.lock().await;
        inner.ended_at = Some(Utc::now());
        inner.state = inner.state.transition(CallEvent::DrainComplete).unwrap_or(CallState::Ended);
    }

    /// Carrier hangup observed out-of-band (webhook `CallStatus=completed`
    /// or equivalent). Wakes every waiter within the polling granularity.
    pub async fn mark_hung_up(&self) {
        let mut inner = self.inner.lock().await;
        inner.hung_up = true;
    }

    async fn record_turn(&self, speaker: Speaker, text: String) {
        let mut inner = self.inner.lock().await;
        inner.transcript.push(TranscriptEntry { speaker, text: text.clone(), timestamp: Utc::now() });
        if speaker == Speaker::User {
            inner.pending_turn = Some(text);
        }
    }

    async fn take_pending_turn(&self) -> Option<String> {
        self.inner.lock().await.pending_turn.take()
    }

    /// Places the call, waits for media readiness, opens the
    /// configured backend, delivers `initial_message`, and waits for
    /// the user's first turn.
    pub async fn start(self: &Arc<Self>, initial_message: &str) -> Result<String, BridgeError> {
        self.transition(CallEvent::Place).await?;

        let webhook_url = format!(
            "{}/twiml",
            self.config.server.public_url.clone().unwrap_or_default()
        );
        let carrier_call_ref = self
            .carrier
            .place_outbound(&self.user_number, &self.config.carrier.from_number.clone().unwrap_or_default(), &webhook_url)
            .await?;
        self.inner.lock().await.carrier_call_ref = Some(CarrierCallRef(carrier_call_ref.clone()));

        if matches!(self.config.carrier.kind, Some(crate::config::CarrierKind::B)) {
            let ws_url = self.media_ws_url();
            self.carrier.start_media_stream(&carrier_call_ref, &ws_url).await?;
        }

        self.wait_for_media_ready(Duration::from_millis(self.config.timeouts.media_ready_timeout_ms))
            .await?;

        self.connect_backend().await?;
        self.transition(CallEvent::MediaAndAgentReady).await?;

        self.speak_internal(initial_message).await?;

        let timeout = Duration::from_millis(self.config.timeouts.turn_timeout_ms);
        self.wait_for_user_turn(timeout).await
    }

    pub fn media_ws_url(&self) -> String {
        let base = self
            .config
            .server
            .websocket_url
            .clone()
            .or_else(|| self.config.server.public_url.clone())
            .unwrap_or_default();
        format!("{}/media-stream?token={}", base, self.ws_token)
    }

    /// CONNECTING_MEDIA → READY requires mediaSocket open AND
    /// streamReady AND the agent stream connected; this waits on the
    /// first two by polling, since readiness arrives asynchronously
    /// via carrier webhook/media-stream events.
    async fn wait_for_media_ready(&self, timeout: Duration) -> Result<(), BridgeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let inner = self.inner.lock().await;
                let answered = matches!(inner.state, CallState::ConnectingMedia | CallState::Ready);
                if answered && inner.media_sink_attached && inner.stream_ready {
                    return Ok(());
                }
                if inner.hung_up {
                    return Err(HangupError.into());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                self.transition(CallEvent::Fail).await.ok();
                return Err(TimeoutError::new("media readiness").into());
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
    }

    async fn connect_backend(self: &Arc<Self>) -> Result<(), BridgeError> {
        use crate::config::VoiceBackend;
        match self.config.voice_backend {
            VoiceBackend::Unified => {
                let callbacks: Arc<dyn SpeechCallbacks> = Arc::new(UnifiedCallbacks { session: Arc::downgrade(self) });
                let agent_config = SpeechAgentConfig {
                    endpoint: self.config.speech_model.endpoint.clone().unwrap_or_default(),
                    api_key: self.config.speech_model.api_key.clone().unwrap_or_default(),
                    voice_id: self.config.speech_model.voice_id.clone(),
                    max_tokens: self.config.speech_model.max_tokens,
                    temperature: self.config.speech_model.temperature,
                    top_p: self.config.speech_model.top_p,
                    system_prompt: self.config.speech_model.system_prompt.clone(),
                    tools: self.tools.specs().to_vec(),
                };
                let session = Arc::new(SpeechSession::new(agent_config, callbacks));
                session
                    .connect()
                    .await
                    .map_err(BridgeError::from)?;
                self.inner.lock().await.backend = Some(Backend::Unified(session));
            }
            VoiceBackend::SplitWithLlmBrain | VoiceBackend::SplitWithSttTtsOnly => {
                let pipeline = SplitPipeline::new(
                    self.config.vad.clone(),
                    self.config.stt.clone(),
                    self.config.llm_brain.clone(),
                    self.config.tts.clone(),
                    self.tools.clone(),
                )
                .map_err(BridgeError::from)?;
                self.inner.lock().await.backend = Some(Backend::Split(Arc::new(pipeline)));
            }
        }
        Ok(())
    }

    /// unified: `sendText(message, USER)`; split: `injectContext` then
    /// speak. Both then wait for the next user turn.
    pub async fn inject(self: &Arc<Self>, message: &str) -> Result<String, BridgeError> {
        let _guard = self.op_lock.lock().await;
        self.require_ready().await?;
        let backend = self.current_backend().await;
        match backend {
            Some(Backend::Unified(session)) => {
                session.send_text(message, SpeechRole::User).await;
            }
            Some(Backend::Split(pipeline)) => {
                self.transition(CallEvent::EnterSpeaking).await.ok();
                let session = self.clone();
                let reply = pipeline
                    .inject_and_speak(message, move |frame| session.enqueue_audio_frame_blocking(frame))
                    .await?;
                self.record_turn(Speaker::Agent, reply).await;
                self.transition(CallEvent::ReturnToReady).await.ok();
            }
            None => return Err(MediaError { kind: MediaErrorKind::NotReady }.into()),
        }
        let timeout = Duration::from_millis(self.config.timeouts.turn_timeout_ms);
        self.wait_for_user_turn(timeout).await
    }

    /// Fire-and-forget: enqueue/speak without waiting for a reply.
    pub async fn speak(self: &Arc<Self>, message: &str) -> Result<(), BridgeError> {
        let _guard = self.op_lock.lock().await;
        self.require_ready().await?;
        self.speak_internal(message).await
    }

    async fn speak_internal(self: &Arc<Self>, message: &str) -> Result<(), BridgeError> {
        let backend = self.current_backend().await;
        match backend {
            Some(Backend::Unified(session)) => {
                session.send_text(message, SpeechRole::User).await;
            }
            Some(Backend::Split(pipeline)) => {
                self.transition(CallEvent::EnterSpeaking).await.ok();
                let session = self.clone();
                let reply = pipeline
                    .speak(message, move |frame| session.enqueue_audio_frame_blocking(frame))
                    .await?;
                self.record_turn(Speaker::Agent, reply).await;
                self.transition(CallEvent::ReturnToReady).await.ok();
            }
            None => return Err(MediaError { kind: MediaErrorKind::NotReady }.into()),
        }
        Ok(())
    }

    /// Delivers a closing message, waits a bounded drain, hangs up,
    /// and closes all sockets.
    pub async fn end(self: &Arc<Self>, message: &str) -> Result<(), BridgeError> {
        let _guard = self.op_lock.lock().await;
        self.transition(CallEvent::BeginEnding).await.ok();
        if !message.is_empty() {
            let _ = self.speak_internal(message).await;
        }

        let drain_ms = match self.config.voice_backend {
            crate::config::VoiceBackend::Unified => UNIFIED_DRAIN_MS,
            _ => SPLIT_DRAIN_MS,
        };
        tokio::time::sleep(Duration::from_millis(drain_ms)).await;

        let backend = self.current_backend().await;
        if let Some(Backend::Unified(session)) = backend {
            session.close().await;
        }

        if let Some(carrier_call_ref) = self.carrier_call_ref().await {
            if let Err(e) = self.carrier.hangup(carrier_call_ref.as_str()).await {
                tracing::warn!(call_id = %self.call_id, error = %e, "hangup failed during end()");
            }
        }

        if let Some(handle) = self.writer_task.lock().await.take() {
            handle.abort();
        }

        let mut inner = self.inner.lock().await;
        inner.hung_up = true;
        inner.ended_at = Some(Utc::now());
        inner.state = inner.state.transition(CallEvent::DrainComplete).unwrap_or(CallState::Ended);
        Ok(())
    }

    /// Resolves when the agent reports a completed user turn with
    /// non-empty text, or rejects `HangupError` once the call ends.
    /// Polls at `POLL_INTERVAL_MS` granularity, well under the 100 ms
    /// bound spec.md §4.6 requires for hangup detection.
    pub async fn wait_for_user_turn(&self, timeout: Duration) -> Result<String, BridgeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(text) = self.take_pending_turn().await {
                if !text.trim().is_empty() {
                    return Ok(text);
                }
            }
            if self.is_hung_up().await {
                return Err(HangupError.into());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TimeoutError::new("user turn").into());
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
    }

    async fn require_ready(&self) -> Result<(), BridgeError> {
        if !self.state().await.is_ready_or_substate() {
            return Err(MediaError { kind: MediaErrorKind::NotReady }.into());
        }
        Ok(())
    }

    async fn current_backend(&self) -> Option<Backend> {
        let inner = self.inner.lock().await;
        match &inner.backend {
            Some(Backend::Unified(s)) => Some(Backend::Unified(s.clone())),
            Some(Backend::Split(p)) => Some(Backend::Split(p.clone())),
            None => None,
        }
    }

    /// Downsample/encode/enqueue one 24 kHz PCM chunk from the unified
    /// agent's `onAudioOut` callback.
    async fn enqueue_agent_audio(&self, pcm24k: Vec<i16>) {
        let pcm8k = codec::downsample_24k_to_8k(&pcm24k);
        let mulaw = codec::mulaw_encode_buf(&pcm8k);
        for frame in mulaw.chunks(160) {
            self.enqueue_audio_frame(frame.to_vec()).await;
        }
    }

    async fn enqueue_audio_frame(&self, mulaw: Vec<u8>) {
        let (stream_id, stream_ready) = {
            let inner = self.inner.lock().await;
            (inner.media_stream_id.clone(), inner.stream_ready)
        };
        let Some(stream_sid) = stream_id else {
            tracing::debug!(call_id = %self.call_id, "dropping audio frame, no mediaStreamId yet");
            return;
        };
        if !stream_ready {
            return;
        }
        if self.audio_tx.try_send(MediaFrame::Audio { stream_sid, mulaw }).is_err() {
            tracing::warn!(call_id = %self.call_id, "outbound media queue full, dropping oldest frame");
        }
    }

    /// Split-mode `on_frame` callback is synchronous; bridge it onto
    /// the async enqueue path via `try_send` directly (the channel is
    /// already bounded and non-blocking on the producer side).
    fn enqueue_audio_frame_blocking(&self, mulaw: Vec<u8>) {
        let stream_id_fut = self.inner.try_lock();
        let Ok(inner) = stream_id_fut else {
            return;
        };
        let Some(stream_sid) = inner.media_stream_id.clone() else {
            return;
        };
        if !inner.stream_ready {
            return;
        }
        drop(inner);
        if self.audio_tx.try_send(MediaFrame::Audio { stream_sid, mulaw }).is_err() {
            tracing::warn!(call_id = %self.call_id, "outbound media queue full, dropping oldest frame");
        }
    }

    /// Barge-in: emit the carrier's "clear outbound audio" directive.
    /// Sent on the control queue, which the writer always drains ahead
    /// of buffered audio (spec.md §4.6/§8).
    async fn enqueue_clear(&self) {
        let stream_id = self.inner.lock().await.media_stream_id.clone();
        if let Some(stream_sid) = stream_id {
            let _ = self.control_tx.send(MediaFrame::Clear { stream_sid }).await;
        }
    }
}

/// Sole writer of the carrier's media socket — mirrors the teacher's
/// `send_task` in `server/device.rs`, generalized to two producer
/// queues the way C4's speech-agent writer already arbitrates its own
/// control/audio streams. `control_rx` is always polled first via
/// `biased` select, so a `Clear` queued mid-burst is emitted on the
/// very next tick rather than waiting behind buffered audio. On a
/// `Clear`, the pending audio backlog is drained immediately so the
/// carrier doesn't keep playing agent speech the model already
/// abandoned. Audio is paced at 20 ms per 160-byte chunk regardless of
/// producer rate.
async fn writer_loop(
    call_id: CallId,
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut control_rx: mpsc::Receiver<MediaFrame>,
    mut audio_rx: mpsc::Receiver<MediaFrame>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = control_rx.recv() => frame,
            frame = audio_rx.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        let envelope = match &frame {
            MediaFrame::Audio { stream_sid, mulaw } => serde_json::json!({
                "event": "media",
                "streamSid": stream_sid,
                "media": { "payload": STANDARD.encode(mulaw) },
            }),
            MediaFrame::Clear { stream_sid } => serde_json::json!({
                "event": "clear",
                "streamSid": stream_sid,
            }),
        };
        if sink.send(WsMessage::Text(envelope.to_string().into())).await.is_err() {
            tracing::warn!(%call_id, "media socket closed, stopping writer");
            break;
        }
        if matches!(frame, MediaFrame::Clear { .. }) {
            let mut discarded = 0u32;
            while audio_rx.try_recv().is_ok() {
                discarded += 1;
            }
            if discarded > 0 {
                tracing::debug!(%call_id, discarded, "discarded buffered audio after clear");
            }
        } else {
            tokio::time::sleep(Duration::from_millis(FRAME_PACE_MS)).await;
        }
    }
}

/// Bridges the unified speech agent's callbacks back into the session,
/// holding only a `Weak` reference to break the `CallSession` ->
/// `SpeechSession` -> callbacks -> `CallSession` cycle.
struct UnifiedCallbacks {
    session: Weak<CallSession>,
}

#[async_trait]
impl SpeechCallbacks for UnifiedCallbacks {
    async fn on_audio_out(&self, pcm24k: Vec<i16>) {
        if let Some(session) = self.session.upgrade() {
            session.enqueue_agent_audio(pcm24k).await;
        }
    }

    async fn on_text(&self, text: String, role: SpeechRole) {
        if let Some(session) = self.session.upgrade() {
            let speaker = if role == SpeechRole::User { Speaker::User } else { Speaker::Agent };
            session.record_turn(speaker, text).await;
        }
    }

    async fn on_tool_use(&self, name: String, id: String, input: Value) {
        let Some(session) = self.session.upgrade() else { return };
        session.transition(CallEvent::EnterToolCall).await.ok();
        let result = session.tools.execute(&name, input).await;
        if let Some(Backend::Unified(speech)) = session.current_backend().await {
            speech.send_tool_result(&id, &result.output).await;
        }
        session.transition(CallEvent::ReturnToReady).await.ok();
    }

    async fn on_turn_complete(&self) {
        // Accumulated user text already recorded per `on_text` call;
        // nothing further to do here besides letting pollers observe
        // the freshly-set `pending_turn`.
    }

    async fn on_interruption(&self) {
        if let Some(session) = self.session.upgrade() {
            session.enqueue_clear().await;
        }
    }
}

impl From<IllegalTransition> for BridgeError {
    fn from(e: IllegalTransition) -> Self {
        BridgeError::Other(anyhow::Error::from(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_reach_ready_and_back() {
        let s = CallState::New;
        let s = s.transition(CallEvent::Place).unwrap();
        assert_eq!(s, CallState::Placing);
        let s = s.transition(CallEvent::CarrierAnswered).unwrap();
        assert_eq!(s, CallState::ConnectingMedia);
        let s = s.transition(CallEvent::MediaAndAgentReady).unwrap();
        assert_eq!(s, CallState::Ready);
        let s = s.transition(CallEvent::EnterSpeaking).unwrap();
        assert_eq!(s, CallState::SpeakingAgent);
        let s = s.transition(CallEvent::ReturnToReady).unwrap();
        assert_eq!(s, CallState::Ready);
    }

    #[test]
    fn illegal_transition_is_a_caught_error_not_a_panic() {
        let err = CallState::New.transition(CallEvent::EnterSpeaking).unwrap_err();
        assert_eq!(err.from, CallState::New);
    }

    #[test]
    fn ready_and_substates_satisfy_i4() {
        assert!(CallState::Ready.is_ready_or_substate());
        assert!(CallState::SpeakingAgent.is_ready_or_substate());
        assert!(CallState::ListeningUser.is_ready_or_substate());
        assert!(CallState::ToolCall.is_ready_or_substate());
        assert!(!CallState::New.is_ready_or_substate());
        assert!(!CallState::Ending.is_ready_or_substate());
    }
}
