//! Streaming text-to-speech with a jitter buffer. Grounded on the
//! teacher's `voice/tts.rs` (streaming-by-chunk production, `hound`-free
//! raw PCM handling) generalized to a cloud HTTP streaming client with
//! the 100ms accumulate-then-drain jitter buffer spec.md §4.5 requires,
//! rather than the teacher's local Coqui inference.

use crate::codec;
use crate::config::TtsConfig;
use crate::error::{AgentError, AgentErrorKind};
use futures_util::{Stream, StreamExt};

/// 100ms of mu-law output at 8 kHz.
const JITTER_THRESHOLD_BYTES: usize = 800;
/// One 20ms mu-law frame at 8 kHz.
const FRAME_BYTES: usize = 160;

pub struct StreamingTts {
    config: TtsConfig,
    client: reqwest::Client,
}

impl StreamingTts {
    pub fn new(config: TtsConfig) -> Self {
        Self { config, client: reqwest::Client::new() }
    }

    /// POST `text` to the TTS endpoint, returning a stream of PCM16
    /// chunks at 24 kHz as the response body arrives. A 24 kHz sample
    /// split across two HTTP chunks is carried over rather than
    /// dropped.
    pub async fn synthesize_stream(
        &self,
        text: &str,
    ) -> Result<impl Stream<Item = Result<Vec<i16>, AgentError>>, AgentError> {
        let endpoint = self
            .config
            .endpoint
            .as_deref()
            .ok_or_else(|| AgentError::new(AgentErrorKind::ConnectFailed, "no tts.endpoint configured"))?;

        let mut req = self.client.post(endpoint).json(&serde_json::json!({
            "text": text,
            "voice": self.config.voice,
            "model": self.config.model,
            "sample_rate_hz": 24_000,
        }));
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| AgentError::new(AgentErrorKind::ConnectFailed, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AgentError::new(
                AgentErrorKind::ConnectFailed,
                format!("tts endpoint returned {}", resp.status()),
            ));
        }

        let mut remainder: Vec<u8> = Vec::new();
        Ok(resp.bytes_stream().map(move |chunk| {
            let chunk = chunk.map_err(|e| AgentError::new(AgentErrorKind::StreamError, e.to_string()))?;
            let mut buf = std::mem::take(&mut remainder);
            buf.extend_from_slice(&chunk);
            if buf.len() % 2 == 1 {
                let last = buf.pop().expect("checked non-empty by odd length");
                remainder.push(last);
            }
            Ok(codec::le_bytes_to_pcm16(&buf))
        }))
    }
}

/// Accumulates mu-law 8 kHz bytes and releases them in fixed 20ms
/// frames only once 100ms has buffered, smoothing burst delivery from
/// the TTS stream. The caller is expected to downsample 24 kHz PCM to
/// 8 kHz and mu-law encode it before pushing here.
pub struct JitterBuffer {
    buffer: std::collections::VecDeque<u8>,
    started: bool,
}

impl JitterBuffer {
    pub fn new() -> Self {
        Self { buffer: std::collections::VecDeque::new(), started: false }
    }

    /// Push newly produced mu-law bytes; returns any 160-byte frames
    /// now ready to send, in order.
    pub fn push(&mut self, mulaw: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend(mulaw);
        let mut frames = Vec::new();

        if !self.started {
            if self.buffer.len() < JITTER_THRESHOLD_BYTES {
                return frames;
            }
            self.started = true;
        }

        while self.buffer.len() >= FRAME_BYTES {
            frames.push(self.buffer.drain(..FRAME_BYTES).collect());
        }
        frames
    }

    /// Flush any buffered tail at end-of-stream, regardless of
    /// whether the 100ms threshold was ever reached.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.drain(..).collect())
        }
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_buffer_withholds_output_below_threshold() {
        let mut jb = JitterBuffer::new();
        let frames = jb.push(&[0u8; 400]);
        assert!(frames.is_empty());
    }

    #[test]
    fn jitter_buffer_releases_full_frames_once_threshold_crossed() {
        let mut jb = JitterBuffer::new();
        let frames = jb.push(&[1u8; 900]);
        // 900 bytes once started: floor(900/160) = 5 frames of 160, 100 remain buffered.
        assert_eq!(frames.len(), 5);
        assert!(frames.iter().all(|f| f.len() == FRAME_BYTES));
    }

    #[test]
    fn jitter_buffer_flush_emits_remaining_tail() {
        let mut jb = JitterBuffer::new();
        jb.push(&[1u8; 900]);
        let tail = jb.flush();
        assert_eq!(tail, Some(vec![1u8; 100]));
        assert_eq!(jb.flush(), None);
    }
}
