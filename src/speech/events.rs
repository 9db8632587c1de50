//! Closed sum types for the speech model's bidirectional wire
//! protocol. A dynamic JSON shape on this wire is exactly the pattern
//! spec.md §9 calls out for replacement; every event the model can
//! send or we can emit is a named variant here, with `#[serde(other)]`
//! catching anything the vocabulary doesn't enumerate rather than
//! failing to deserialize.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentType {
    Text,
    Audio,
    Tool,
}

/// Reason the model gave for ending a content block. Anything not
/// named here decodes to `Unknown` and is treated like a normal
/// completion (Open Question #3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    Interrupted,
    EndTurn,
    #[serde(other)]
    Unknown,
}

/// Events the session sends upstream to the model.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    SessionStart {
        max_tokens: u32,
        temperature: f32,
        top_p: f32,
    },
    PromptStart {
        voice_id: String,
        audio_sample_rate_hz: u32,
        tools: Vec<crate::tools::ToolSpec>,
    },
    ContentStart {
        role: Role,
        content_type: ContentType,
        interactive: bool,
        sample_rate_hz: Option<u32>,
        tool_use_id: Option<String>,
    },
    TextInput {
        text: String,
    },
    AudioInput {
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },
    ToolResult {
        content: String,
    },
    ContentEnd,
    PromptEnd,
    SessionEnd,
}

/// Events the model sends downstream to the session.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    ContentStart {
        role: Role,
        content_type: ContentType,
    },
    AudioOutput {
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },
    TextOutput {
        role: Role,
        content: String,
    },
    ToolUse {
        name: String,
        id: String,
        content: String,
    },
    ContentEnd {
        #[serde(default)]
        stop_reason: Option<StopReason>,
        #[serde(default)]
        content_type: Option<ContentType>,
    },
    CompletionEnd,
    UsageEvent {
        #[serde(default)]
        input_tokens: Option<u32>,
        #[serde(default)]
        output_tokens: Option<u32>,
    },
    ModelStreamError {
        message: String,
    },
    InternalServerError {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_stop_reason_decodes_without_error() {
        let json = r#"{"type":"ContentEnd","stop_reason":"SOME_NEW_REASON"}"#;
        let event: InboundEvent = serde_json::from_str(json).unwrap();
        match event {
            InboundEvent::ContentEnd { stop_reason: Some(StopReason::Unknown), .. } => {}
            other => panic!("expected Unknown stop reason, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_event_type_decodes_to_unknown_variant() {
        let json = r#"{"type":"somethingFuture"}"#;
        let event: InboundEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, InboundEvent::Unknown));
    }
}
