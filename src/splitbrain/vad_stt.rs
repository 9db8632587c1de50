//! VAD-gated STT: an energy-threshold onset/hangover state machine
//! wraps completed utterances in a WAV and posts them to an STT
//! endpoint. Grounded on the teacher's `src/voice/vad.rs`
//! (`DEFAULT_ONSET_FRAMES`/`DEFAULT_HANGOVER_FRAMES`, `VadState` enum),
//! generalized from continuous frame classification to utterance
//! boundary detection.

use crate::codec;
use crate::config::VadConfig;
use crate::error::{AgentError, AgentErrorKind};
use async_trait::async_trait;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[async_trait]
pub trait SttClient: Send + Sync {
    async fn transcribe(&self, wav_bytes: Vec<u8>) -> Result<String, AgentError>;
}

pub struct HttpSttClient {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpSttClient {
    pub fn new(endpoint: String, api_key: Option<String>) -> Self {
        Self { endpoint, api_key, client: reqwest::Client::new() }
    }
}

#[async_trait]
impl SttClient for HttpSttClient {
    async fn transcribe(&self, wav_bytes: Vec<u8>) -> Result<String, AgentError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "audio/wav")
            .body(wav_bytes);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| AgentError::new(AgentErrorKind::StreamError, e.to_string()))?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AgentError::new(AgentErrorKind::ProtocolError, e.to_string()))?;
        body.get("text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| AgentError::new(AgentErrorKind::ProtocolError, "missing 'text' field in STT response"))
    }
}

enum State {
    Idle,
    Speaking { speech_ms: u64, silence_ms: u64, buffer: Vec<u8> },
}

pub struct VadGatedStt {
    config: VadConfig,
    client: Arc<dyn SttClient>,
    state: Mutex<State>,
    transcribing: AtomicBool,
}

impl VadGatedStt {
    pub fn new(config: VadConfig, client: Arc<dyn SttClient>) -> Self {
        Self { config, client, state: Mutex::new(State::Idle), transcribing: AtomicBool::new(false) }
    }

    /// Feed one chunk of µ-law 8 kHz audio. Returns the transcript once
    /// an utterance completes (speech start then `SILENCE_MS` of
    /// silence); `None` otherwise, including while a previous post is
    /// still in flight.
    pub async fn feed(&self, mulaw_chunk: &[u8]) -> Option<String> {
        if mulaw_chunk.is_empty() {
            return None;
        }
        let energy = chunk_rms_energy(mulaw_chunk);
        let is_speech = energy >= self.config.energy_threshold;
        let chunk_ms = (mulaw_chunk.len() as u64 * 1000) / 8_000;

        let utterance = {
            let mut state = self.state.lock().await;
            match &mut *state {
                State::Idle => {
                    if is_speech {
                        *state = State::Speaking {
                            speech_ms: chunk_ms,
                            silence_ms: 0,
                            buffer: mulaw_chunk.to_vec(),
                        };
                    }
                    None
                }
                State::Speaking { speech_ms, silence_ms, buffer } => {
                    buffer.extend_from_slice(mulaw_chunk);
                    if is_speech {
                        *speech_ms += chunk_ms;
                        *silence_ms = 0;
                        None
                    } else {
                        *silence_ms += chunk_ms;
                        if *speech_ms >= self.config.min_speech_ms && *silence_ms >= self.config.silence_ms {
                            let buffer = std::mem::take(buffer);
                            *state = State::Idle;
                            Some(buffer)
                        } else {
                            None
                        }
                    }
                }
            }
        };

        let buffer = utterance?;
        if self
            .transcribing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let pcm = codec::mulaw_decode_buf(&buffer);
        let wav = wrap_wav_8k_mono_16bit(&pcm);
        let result = self.client.transcribe(wav).await;
        self.transcribing.store(false, Ordering::SeqCst);

        match result {
            Ok(text) if !text.trim().is_empty() => Some(text),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "stt post failed");
                None
            }
        }
    }
}

fn chunk_rms_energy(mulaw: &[u8]) -> f32 {
    let pcm = codec::mulaw_decode_buf(mulaw);
    if pcm.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = pcm.iter().map(|&s| (s as f64) * (s as f64)).sum();
    ((sum_sq / pcm.len() as f64).sqrt()) as f32
}

/// RIFF/WAVE, fmt chunk size 16, PCM, mono, 8000 Hz, 16-bit, per
/// spec.md §6.
fn wrap_wav_8k_mono_16bit(pcm: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buf = Vec::new();
    {
        let cursor = Cursor::new(&mut buf);
        let mut writer = hound::WavWriter::new(cursor, spec).expect("wav spec is valid");
        for &sample in pcm {
            writer.write_sample(sample).expect("write into in-memory buffer");
        }
        writer.finalize().expect("finalize in-memory wav");
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeStt {
        reply: String,
    }

    #[async_trait]
    impl SttClient for FakeStt {
        async fn transcribe(&self, _wav_bytes: Vec<u8>) -> Result<String, AgentError> {
            Ok(self.reply.clone())
        }
    }

    fn test_config() -> VadConfig {
        VadConfig { silence_ms: 100, min_speech_ms: 60, energy_threshold: 50.0 }
    }

    fn loud_chunk(len: usize) -> Vec<u8> {
        // mu-law encoding of a strong DC tone; well above the test
        // threshold once decoded.
        vec![codec::mulaw_encode(20_000); len]
    }

    fn silent_chunk(len: usize) -> Vec<u8> {
        vec![codec::mulaw_encode(0); len]
    }

    #[tokio::test]
    async fn full_utterance_produces_transcript_after_silence_hangover() {
        let vad = VadGatedStt::new(test_config(), Arc::new(FakeStt { reply: "hello there".into() }));

        // 80ms of loud audio -> 640 samples at 8kHz, chunked to simulate ~20ms frames.
        for _ in 0..4 {
            assert!(vad.feed(&loud_chunk(160)).await.is_none());
        }

        // Silence below the hangover threshold doesn't end the utterance yet.
        assert!(vad.feed(&silent_chunk(160)).await.is_none()); // 20ms silence

        // Enough additional silence crosses SILENCE_MS=100.
        assert!(vad.feed(&silent_chunk(160)).await.is_none()); // 40ms total
        let result = vad.feed(&silent_chunk(800)).await; // +100ms -> 140ms total, over threshold
        assert_eq!(result.as_deref(), Some("hello there"));
    }

    #[tokio::test]
    async fn short_speech_below_min_speech_ms_never_completes_an_utterance() {
        let vad = VadGatedStt::new(test_config(), Arc::new(FakeStt { reply: "should not appear".into() }));
        assert!(vad.feed(&loud_chunk(160)).await.is_none()); // 20ms speech, below MIN_SPEECH_MS=60
        assert!(vad.feed(&silent_chunk(1600)).await.is_none()); // plenty of silence, but speech was too short
    }

    #[test]
    fn wav_wrapper_emits_expected_header_fields() {
        let pcm = vec![0i16, 100, -100, 200];
        let bytes = wrap_wav_8k_mono_16bit(&pcm);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(&bytes[12..16], b"fmt ");
        let fmt_chunk_size = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        assert_eq!(fmt_chunk_size, 16);
        let channels = u16::from_le_bytes(bytes[22..24].try_into().unwrap());
        assert_eq!(channels, 1);
        let sample_rate = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
        assert_eq!(sample_rate, 8_000);
        let bits_per_sample = u16::from_le_bytes(bytes[34..36].try_into().unwrap());
        assert_eq!(bits_per_sample, 16);
    }
}
