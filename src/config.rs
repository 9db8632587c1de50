//! Configuration management
//!
//! Loads process-wide configuration (TOML file + environment overrides),
//! validating that every option required to place a call is present
//! before the server starts. Missing options are enumerated all at once,
//! not fail-on-first.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CarrierKind {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VoiceBackend {
    Unified,
    SplitWithLlmBrain,
    SplitWithSttTtsOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub carrier: CarrierConfig,
    #[serde(default)]
    pub voice_backend: VoiceBackend,
    #[serde(default)]
    pub speech_model: SpeechModelConfig,
    #[serde(default)]
    pub llm_brain: LlmBrainConfig,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub vad: VadConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for VoiceBackend {
    fn default() -> Self {
        VoiceBackend::Unified
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CarrierConfig {
    pub kind: Option<CarrierKind>,
    /// Account id / auth token (carrier A) or API key (carrier B).
    pub account_id: Option<String>,
    pub auth_token: Option<String>,
    /// Ed25519 public key used to verify carrier B webhook signatures.
    pub public_key: Option<String>,
    pub from_number: Option<String>,
    pub user_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechModelConfig {
    #[serde(default = "default_speech_model_id")]
    pub model_id: String,
    #[serde(default = "default_voice_id")]
    pub voice_id: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub system_prompt: String,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
}

fn default_speech_model_id() -> String {
    "nova-sonic-v1".to_string()
}
fn default_voice_id() -> String {
    "matthew".to_string()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}

impl Default for SpeechModelConfig {
    fn default() -> Self {
        Self {
            model_id: default_speech_model_id(),
            voice_id: default_voice_id(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            system_prompt: String::new(),
            endpoint: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmBrainConfig {
    #[serde(default = "default_brain_model")]
    pub model_id: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub system_prompt: String,
    /// Template used by `injectContext`; must contain `{text}`.
    #[serde(default = "default_context_template")]
    pub context_template: String,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
}

fn default_brain_model() -> String {
    "claude-sonnet".to_string()
}
fn default_context_template() -> String {
    "[System: {text}]".to_string()
}

impl Default for LlmBrainConfig {
    fn default() -> Self {
        Self {
            model_id: default_brain_model(),
            region: None,
            system_prompt: String::new(),
            context_template: default_context_template(),
            endpoint: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SttConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TtsConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub voice: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    #[serde(default = "default_silence_ms")]
    pub silence_ms: u64,
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u64,
    #[serde(default = "default_energy_threshold")]
    pub energy_threshold: f32,
}

fn default_silence_ms() -> u64 {
    800
}
fn default_min_speech_ms() -> u64 {
    300
}
fn default_energy_threshold() -> f32 {
    200.0
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            silence_ms: default_silence_ms(),
            min_speech_ms: default_min_speech_ms(),
            energy_threshold: default_energy_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_turn_timeout_ms")]
    pub turn_timeout_ms: u64,
    #[serde(default = "default_media_ready_timeout_ms")]
    pub media_ready_timeout_ms: u64,
}

fn default_turn_timeout_ms() -> u64 {
    180_000
}
fn default_media_ready_timeout_ms() -> u64 {
    15_000
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            turn_timeout_ms: default_turn_timeout_ms(),
            media_ready_timeout_ms: default_media_ready_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL the carrier POSTs webhooks to.
    pub public_url: Option<String>,
    /// WebSocket URL advertised to the carrier for the media stream,
    /// when it differs from `public_url` (e.g. a tunnel that only
    /// forwards WS traffic).
    pub websocket_url: Option<String>,
    /// Operator has explicitly marked this deployment as tunneled:
    /// webhook signature verification may be bypassed (logged every
    /// time), and untokenized WS upgrades may bind best-effort to the
    /// most recently created session.
    #[serde(default)]
    pub trust_without_signature: bool,
    #[serde(default)]
    pub https: bool,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8088
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
            websocket_url: None,
            trust_without_signature: false,
            https: false,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            carrier: CarrierConfig::default(),
            voice_backend: VoiceBackend::default(),
            speech_model: SpeechModelConfig::default(),
            llm_brain: LlmBrainConfig::default(),
            stt: SttConfig::default(),
            tts: TtsConfig::default(),
            vad: VadConfig::default(),
            timeouts: TimeoutsConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `call-bridge.toml` in the current
    /// directory, falling back to defaults if absent, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_path())
    }

    /// Same as `load`, but reads from an arbitrary path. Split out so
    /// the loader can be exercised against a scratch file in tests
    /// without touching the process's current directory.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                source: e,
            })?;
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Enumerate every missing option required to place a call. Returns
    /// `Ok(())` if the configuration is complete enough to run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();

        if self.carrier.kind.is_none() {
            missing.push("carrier.kind".to_string());
        }
        if self.carrier.account_id.is_none() {
            missing.push("carrier.account_id".to_string());
        }
        match self.carrier.kind {
            Some(CarrierKind::A) if self.carrier.auth_token.is_none() => {
                missing.push("carrier.auth_token".to_string());
            }
            Some(CarrierKind::B) if self.carrier.public_key.is_none() => {
                missing.push("carrier.public_key".to_string());
            }
            _ => {}
        }
        if self.carrier.from_number.is_none() {
            missing.push("carrier.from_number".to_string());
        }
        if self.server.public_url.is_none() {
            missing.push("server.public_url".to_string());
        }

        if !missing.is_empty() {
            return Err(ConfigError::MissingRequired(missing));
        }
        Ok(())
    }
}

pub fn config_path() -> PathBuf {
    PathBuf::from("call-bridge.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fails_validation_with_enumerated_missing_keys() {
        let config = Config::default();
        match config.validate() {
            Err(ConfigError::MissingRequired(missing)) => {
                assert!(missing.contains(&"carrier.kind".to_string()));
                assert!(missing.contains(&"server.public_url".to_string()));
            }
            other => panic!("expected MissingRequired, got {other:?}"),
        }
    }

    #[test]
    fn complete_carrier_a_config_validates() {
        let mut config = Config::default();
        config.carrier.kind = Some(CarrierKind::A);
        config.carrier.account_id = Some("AC123".into());
        config.carrier.auth_token = Some("secret".into());
        config.carrier.from_number = Some("+15550000000".into());
        config.server.public_url = Some("https://example.ngrok.io".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_from_missing_path_falls_back_to_defaults_and_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("call-bridge.toml");
        match Config::load_from(&path) {
            Err(ConfigError::MissingRequired(missing)) => {
                assert!(missing.contains(&"carrier.kind".to_string()));
            }
            other => panic!("expected MissingRequired, got {other:?}"),
        }
    }

    #[test]
    fn load_from_reads_a_written_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("call-bridge.toml");
        std::fs::write(
            &path,
            r#"
            [carrier]
            kind = "a"
            account_id = "AC123"
            auth_token = "secret"
            from_number = "+15550000000"

            [server]
            public_url = "https://example.ngrok.io"
            "#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.carrier.kind, Some(CarrierKind::A));
        assert_eq!(config.carrier.account_id.as_deref(), Some("AC123"));
    }
}
