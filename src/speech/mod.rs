//! Speech Agent Port (C4), unified mode. A bidirectional session
//! abstraction over the cloud speech-to-speech model's event stream.
//! Grounded on the teacher's `src/agent/llm.rs` (typed request/response
//! structs around a streaming API) and `src/server/realtime_voice.rs`
//! (`SessionState`, the echo-cooldown/interrupt handling that is this
//! component's barge-in contract in miniature), generalized into the
//! two-queue priority-select discipline spec.md §4.4 and §9 require.

pub mod events;

use crate::codec;
use crate::error::{AgentError, AgentErrorKind};
use crate::tools::ToolSpec;
use async_trait::async_trait;
use events::{ContentType, InboundEvent, OutboundEvent, Role, StopReason};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Per-session callbacks, required at construction — the teacher's
/// optional/nullable callback fields (`src/agent/llm.rs`'s
/// `on_token: Option<Box<dyn Fn(...)>>`) are exactly the dynamic
/// pattern spec.md §9 says to replace with a constructor-time
/// requirement.
#[async_trait]
pub trait SpeechCallbacks: Send + Sync {
    async fn on_audio_out(&self, pcm24k: Vec<i16>);
    async fn on_text(&self, text: String, role: Role);
    async fn on_tool_use(&self, name: String, id: String, input: Value);
    async fn on_turn_complete(&self);
    async fn on_interruption(&self);
}

#[derive(Debug, Clone)]
pub struct SpeechAgentConfig {
    pub endpoint: String,
    pub api_key: String,
    pub voice_id: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub system_prompt: String,
    pub tools: Vec<ToolSpec>,
}

const AUDIO_QUEUE_CAPACITY: usize = 100;
const CONTROL_QUEUE_CAPACITY: usize = 32;
const TEARDOWN_DRAIN_MS: u64 = 500;

struct ToolAccumulator {
    name: String,
    content: String,
}

pub struct SpeechSession {
    config: SpeechAgentConfig,
    callbacks: Arc<dyn SpeechCallbacks>,
    control_tx: mpsc::Sender<OutboundEvent>,
    control_rx: Mutex<Option<mpsc::Receiver<OutboundEvent>>>,
    audio_tx: mpsc::Sender<OutboundEvent>,
    audio_rx: Mutex<Option<mpsc::Receiver<OutboundEvent>>>,
    /// Poked by `send_audio` when `audio_tx.try_send` finds the queue
    /// full; `writer_loop` is the only task that can actually act on
    /// it, since it alone owns `audio_rx` after `connect()`.
    audio_drop_signal: Arc<Notify>,
    model_speaking_tx: watch::Sender<bool>,
    model_speaking_rx: watch::Receiver<bool>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
}

impl SpeechSession {
    pub fn new(config: SpeechAgentConfig, callbacks: Arc<dyn SpeechCallbacks>) -> Self {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE_CAPACITY);
        let (model_speaking_tx, model_speaking_rx) = watch::channel(false);
        Self {
            config,
            callbacks,
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            audio_tx,
            audio_rx: Mutex::new(Some(audio_rx)),
            audio_drop_signal: Arc::new(Notify::new()),
            model_speaking_tx,
            model_speaking_rx,
            writer_task: Mutex::new(None),
            reader_task: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Open the stream, emit the fixed setup sequence, return once the
    /// stream is writable. See spec.md §4.4 for the exact ordering
    /// contract this must not deviate from.
    pub async fn connect(&self) -> Result<(), AgentError> {
        let url = format!("{}?api_key={}", self.config.endpoint, self.config.api_key);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| AgentError::new(AgentErrorKind::ConnectFailed, e.to_string()))?;
        let (mut sink, stream) = ws_stream.split();

        send_ws_event(&mut sink, &OutboundEvent::SessionStart {
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
        })
        .await
        .map_err(|e| AgentError::new(AgentErrorKind::ConnectFailed, e.to_string()))?;

        send_ws_event(&mut sink, &OutboundEvent::PromptStart {
            voice_id: self.config.voice_id.clone(),
            audio_sample_rate_hz: 24_000,
            tools: self.config.tools.clone(),
        })
        .await
        .map_err(|e| AgentError::new(AgentErrorKind::ConnectFailed, e.to_string()))?;

        send_ws_event(&mut sink, &OutboundEvent::ContentStart {
            role: Role::System,
            content_type: ContentType::Text,
            interactive: false,
            sample_rate_hz: None,
            tool_use_id: None,
        })
        .await
        .map_err(|e| AgentError::new(AgentErrorKind::ConnectFailed, e.to_string()))?;
        send_ws_event(&mut sink, &OutboundEvent::TextInput { text: self.config.system_prompt.clone() })
            .await
            .map_err(|e| AgentError::new(AgentErrorKind::ConnectFailed, e.to_string()))?;
        send_ws_event(&mut sink, &OutboundEvent::ContentEnd)
            .await
            .map_err(|e| AgentError::new(AgentErrorKind::ConnectFailed, e.to_string()))?;

        send_ws_event(&mut sink, &OutboundEvent::ContentStart {
            role: Role::User,
            content_type: ContentType::Audio,
            interactive: true,
            sample_rate_hz: Some(16_000),
            tool_use_id: None,
        })
        .await
        .map_err(|e| AgentError::new(AgentErrorKind::ConnectFailed, e.to_string()))?;

        let control_rx = self
            .control_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| AgentError::new(AgentErrorKind::ConnectFailed, "already connected"))?;
        let audio_rx = self
            .audio_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| AgentError::new(AgentErrorKind::ConnectFailed, "already connected"))?;
        let speaking_rx = self.model_speaking_rx.clone();
        let drop_signal = self.audio_drop_signal.clone();

        let writer = tokio::spawn(writer_loop(sink, control_rx, audio_rx, speaking_rx, drop_signal));
        let reader = tokio::spawn(reader_loop(
            stream,
            self.callbacks.clone(),
            self.model_speaking_tx.clone(),
        ));

        *self.writer_task.lock().await = Some(writer);
        *self.reader_task.lock().await = Some(reader);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Enqueue audio for the model. Control events never drop; audio
    /// does when the queue is saturated (spec.md §5). `audio_rx` is
    /// owned by `writer_loop` for the life of the connection, so
    /// eviction has to happen there, where the backlog is actually
    /// visible — this path only logs what `writer_loop` would have
    /// already started discarding.
    pub async fn send_audio(&self, pcm16k: &[i16]) {
        let payload = codec::pcm16_to_le_bytes(pcm16k);
        let event = OutboundEvent::AudioInput { payload };
        if self.audio_tx.try_send(event).is_err() {
            tracing::warn!("speech agent audio queue full, dropping oldest buffered frame");
            self.audio_drop_signal.notify_one();
        }
    }

    pub async fn send_text(&self, text: &str, role: Role) {
        let _ = self
            .control_tx
            .send(OutboundEvent::ContentStart {
                role,
                content_type: ContentType::Text,
                interactive: false,
                sample_rate_hz: None,
                tool_use_id: None,
            })
            .await;
        let _ = self
            .control_tx
            .send(OutboundEvent::TextInput { text: text.to_string() })
            .await;
        let _ = self.control_tx.send(OutboundEvent::ContentEnd).await;
    }

    pub async fn send_tool_result(&self, tool_use_id: &str, result: &str) {
        let _ = self
            .control_tx
            .send(OutboundEvent::ContentStart {
                role: Role::Tool,
                content_type: ContentType::Tool,
                interactive: false,
                sample_rate_hz: None,
                tool_use_id: Some(tool_use_id.to_string()),
            })
            .await;
        let _ = self
            .control_tx
            .send(OutboundEvent::ToolResult { content: result.to_string() })
            .await;
        let _ = self.control_tx.send(OutboundEvent::ContentEnd).await;
    }

    /// Emit the ordered teardown sequence and drain for up to 500 ms.
    pub async fn close(&self) {
        let _ = self.control_tx.send(OutboundEvent::ContentEnd).await;
        let _ = self.control_tx.send(OutboundEvent::PromptEnd).await;
        let _ = self.control_tx.send(OutboundEvent::SessionEnd).await;

        tokio::time::sleep(std::time::Duration::from_millis(TEARDOWN_DRAIN_MS)).await;

        if let Some(handle) = self.writer_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.reader_task.lock().await.take() {
            handle.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

async fn send_ws_event(
    sink: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    event: &OutboundEvent,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(event)?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Consumes the two outbound queues with strict control-over-audio
/// priority, additionally gating audio on `!modelSpeaking`. Wakes on a
/// new event in either queue OR a flip of `modelSpeaking` — the
/// `watch::Receiver::changed()` branch below is that wake path, since
/// `tokio::select!` only re-evaluates branch guards once per loop
/// iteration.
async fn writer_loop(
    mut sink: impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    mut control_rx: mpsc::Receiver<OutboundEvent>,
    mut audio_rx: mpsc::Receiver<OutboundEvent>,
    mut speaking_rx: watch::Receiver<bool>,
    drop_signal: Arc<Notify>,
) {
    loop {
        let speaking = *speaking_rx.borrow();
        tokio::select! {
            biased;
            event = control_rx.recv() => {
                match event {
                    Some(event) => {
                        if send_ws_event(&mut sink, &event).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
            // Checked ahead of `audio_rx.recv()` so a pending eviction
            // always claims the oldest buffered frame before it would
            // otherwise be sent out.
            _ = drop_signal.notified() => {
                let _ = audio_rx.try_recv();
            }
            event = audio_rx.recv(), if !speaking => {
                match event {
                    Some(event) => {
                        if send_ws_event(&mut sink, &event).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
            changed = speaking_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

async fn reader_loop(
    mut stream: impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    callbacks: Arc<dyn SpeechCallbacks>,
    model_speaking_tx: watch::Sender<bool>,
) {
    let mut tool_accumulators: HashMap<String, ToolAccumulator> = HashMap::new();
    let mut active_tool_id: Option<String> = None;

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "speech agent stream read error");
                break;
            }
        };
        let text = match message {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let event: InboundEvent = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, raw = %text, "dropping unparsable speech event frame");
                continue;
            }
        };

        match event {
            InboundEvent::ContentStart { role, content_type } => {
                if role == Role::Assistant || content_type == ContentType::Audio {
                    let _ = model_speaking_tx.send(true);
                }
            }
            InboundEvent::AudioOutput { payload } => {
                let pcm = codec::le_bytes_to_pcm16(&payload);
                callbacks.on_audio_out(pcm).await;
            }
            InboundEvent::TextOutput { role, content } => {
                callbacks.on_text(content, role).await;
            }
            InboundEvent::ToolUse { name, id, content } => {
                tool_accumulators
                    .entry(id.clone())
                    .and_modify(|acc| acc.content.push_str(&content))
                    .or_insert(ToolAccumulator { name, content });
                active_tool_id = Some(id);
            }
            InboundEvent::ContentEnd { stop_reason, content_type } => {
                if content_type == Some(ContentType::Tool) {
                    if let Some(id) = active_tool_id.take() {
                        if let Some(acc) = tool_accumulators.remove(&id) {
                            let input = serde_json::from_str::<Value>(&acc.content)
                                .unwrap_or_else(|_| Value::String(acc.content.clone()));
                            callbacks.on_tool_use(acc.name, id, input).await;
                        }
                    }
                }
                if matches!(stop_reason, Some(StopReason::Interrupted)) {
                    let _ = model_speaking_tx.send(false);
                    callbacks.on_interruption().await;
                } else {
                    let _ = model_speaking_tx.send(false);
                }
            }
            InboundEvent::CompletionEnd => {
                callbacks.on_turn_complete().await;
            }
            InboundEvent::UsageEvent { .. } => {}
            InboundEvent::ModelStreamError { message } => {
                tracing::warn!(%message, "speech model stream error");
            }
            InboundEvent::InternalServerError { message } => {
                tracing::error!(%message, "speech model internal server error");
            }
            InboundEvent::Unknown => {
                tracing::debug!("dropping unrecognized speech event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    /// Collects every frame `writer_loop` sends, without a real socket.
    struct VecSink(std::sync::Arc<std::sync::Mutex<Vec<String>>>);

    impl futures_util::Sink<Message> for VecSink {
        type Error = tokio_tungstenite::tungstenite::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            if let Message::Text(t) = item {
                self.0.lock().unwrap().push(t.to_string());
            }
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn audio_stays_gated_while_model_speaking_then_flushes_after_control() {
        let sent = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = VecSink(sent.clone());
        let (control_tx, control_rx) = mpsc::channel(8);
        let (audio_tx, audio_rx) = mpsc::channel(8);
        let (speaking_tx, speaking_rx) = watch::channel(true);

        audio_tx.try_send(OutboundEvent::AudioInput { payload: vec![1, 2, 3] }).unwrap();
        let drop_signal = Arc::new(Notify::new());
        let handle = tokio::spawn(writer_loop(sink, control_rx, audio_rx, speaking_rx, drop_signal));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            sent.lock().unwrap().is_empty(),
            "audio must stay gated behind modelSpeaking until it flips false"
        );

        control_tx.send(OutboundEvent::ContentEnd).await.unwrap();
        speaking_tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frames = sent.lock().unwrap().clone();
        assert_eq!(frames.len(), 2, "expected the control event and the previously-gated audio frame");
        assert!(frames[0].contains("\"ContentEnd\""), "control must always be written before gated audio");
        assert!(frames[1].contains("\"AudioInput\""));

        drop(control_tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn control_events_skip_ahead_of_already_queued_audio() {
        let sent = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = VecSink(sent.clone());
        let (control_tx, control_rx) = mpsc::channel(8);
        let (audio_tx, audio_rx) = mpsc::channel(8);
        let (_speaking_tx, speaking_rx) = watch::channel(false);

        audio_tx.try_send(OutboundEvent::AudioInput { payload: vec![9] }).unwrap();
        control_tx.try_send(OutboundEvent::ContentEnd).unwrap();

        let drop_signal = Arc::new(Notify::new());
        let handle = tokio::spawn(writer_loop(sink, control_rx, audio_rx, speaking_rx, drop_signal));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frames = sent.lock().unwrap().clone();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("\"ContentEnd\""), "control is biased ahead of audio even when both are ready");

        drop(control_tx);
        drop(audio_tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn drop_signal_evicts_oldest_buffered_audio_frame() {
        let sent = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = VecSink(sent.clone());
        let (control_tx, control_rx) = mpsc::channel(8);
        let (audio_tx, audio_rx) = mpsc::channel(8);
        let (_speaking_tx, speaking_rx) = watch::channel(false);

        audio_tx.try_send(OutboundEvent::AudioInput { payload: vec![1] }).unwrap();
        audio_tx.try_send(OutboundEvent::AudioInput { payload: vec![2] }).unwrap();

        let drop_signal = Arc::new(Notify::new());
        let handle = tokio::spawn(writer_loop(sink, control_rx, audio_rx, speaking_rx, drop_signal.clone()));

        drop_signal.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        control_tx.send(OutboundEvent::ContentEnd).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let frames = sent.lock().unwrap().clone();
        assert_eq!(frames.len(), 2, "one buffered frame was evicted, one audio frame plus control remain");
        let newer_payload = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [2]);
        let older_payload = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [1]);
        assert!(
            frames.iter().any(|f| f.contains(&newer_payload)),
            "the newer buffered frame must survive eviction: {frames:?}"
        );
        assert!(
            !frames.iter().any(|f| f.contains(&older_payload)),
            "the oldest buffered frame must be the one evicted: {frames:?}"
        );

        drop(control_tx);
        drop(audio_tx);
        let _ = handle.await;
    }
}
