//! Split-brain voice pipeline (C5): VAD-gated STT feeding a
//! request/response LLM brain, whose replies are streamed back through
//! a cloud TTS endpoint and jitter-buffered into outbound media frames.
//! Used in place of the unified Speech Agent Port (`speech::SpeechSession`)
//! when `voice_backend` is `split-with-llm-brain` or
//! `split-with-stt-tts-only`.

pub mod brain;
pub mod retry;
pub mod tts_stream;
pub mod vad_stt;

use crate::codec;
use crate::config::{LlmBrainConfig, SttConfig, TtsConfig, VadConfig};
use crate::error::{AgentError, AgentErrorKind};
use crate::tools::ToolConfig;
use brain::LlmBrain;
use futures_util::StreamExt;
use std::sync::Arc;
use tts_stream::{JitterBuffer, StreamingTts};
use vad_stt::{HttpSttClient, SttClient, VadGatedStt};

/// Wires the three split-mode collaborators together behind the same
/// shape of contract the unified `SpeechSession` exposes: feed inbound
/// caller audio in, get spoken replies out as outbound mu-law frames.
pub struct SplitPipeline {
    stt: VadGatedStt,
    brain: LlmBrain,
    tts: StreamingTts,
    tools: Arc<ToolConfig>,
}

impl SplitPipeline {
    pub fn new(
        vad_config: VadConfig,
        stt_config: SttConfig,
        brain_config: LlmBrainConfig,
        tts_config: TtsConfig,
        tools: Arc<ToolConfig>,
    ) -> Result<Self, AgentError> {
        let endpoint = stt_config
            .endpoint
            .clone()
            .ok_or_else(|| AgentError::new(AgentErrorKind::ConnectFailed, "no stt.endpoint configured"))?;
        let stt_client: Arc<dyn SttClient> = Arc::new(HttpSttClient::new(endpoint, stt_config.api_key.clone()));
        Ok(Self {
            stt: VadGatedStt::new(vad_config, stt_client),
            brain: LlmBrain::new(brain_config),
            tts: StreamingTts::new(tts_config),
            tools,
        })
    }

    /// Feed one chunk of caller audio. Returns a completed transcript
    /// once an utterance boundary is crossed, `None` otherwise.
    pub async fn feed_inbound(&self, mulaw_chunk: &[u8]) -> Option<String> {
        self.stt.feed(mulaw_chunk).await
    }

    /// Run a full turn from user speech, speak the reply. `on_frame` is
    /// called once per 20ms mu-law frame, in order, as they become
    /// ready; the caller owns pacing and delivery to the media socket.
    pub async fn speak(&self, user_text: &str, on_frame: impl FnMut(Vec<u8>)) -> Result<String, AgentError> {
        let reply = self.brain.run_turn(user_text, &self.tools).await?;
        self.synthesize_and_emit(&reply, on_frame).await?;
        Ok(reply)
    }

    /// Inject an out-of-band observation via the brain's `injectContext`
    /// path, then speak whatever it decides to say.
    pub async fn inject_and_speak(&self, text: &str, on_frame: impl FnMut(Vec<u8>)) -> Result<String, AgentError> {
        let reply = self.brain.run_injected_turn(text, &self.tools).await?;
        self.synthesize_and_emit(&reply, on_frame).await?;
        Ok(reply)
    }

    async fn synthesize_and_emit(
        &self,
        text: &str,
        mut on_frame: impl FnMut(Vec<u8>),
    ) -> Result<(), AgentError> {
        let mut stream = Box::pin(self.tts.synthesize_stream(text).await?);
        let mut jitter = JitterBuffer::new();

        while let Some(chunk) = stream.next().await {
            let pcm24k = chunk?;
            let pcm8k = codec::downsample_24k_to_8k(&pcm24k);
            let mulaw = codec::mulaw_encode_buf(&pcm8k);
            for frame in jitter.push(&mulaw) {
                on_frame(frame);
            }
        }
        if let Some(tail) = jitter.flush() {
            on_frame(tail);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_requires_stt_endpoint() {
        let err = SplitPipeline::new(
            VadConfig::default(),
            SttConfig::default(),
            LlmBrainConfig::default(),
            TtsConfig::default(),
            Arc::new(ToolConfig::default()),
        )
        .unwrap_err();
        assert_eq!(err.kind, AgentErrorKind::ConnectFailed);
    }
}
