//! LLM brain for the split-brain pipeline: a request/response chat
//! client with a tool loop. Grounded directly on the teacher's
//! `agent/tool_loop.rs` (`run_tool_loop`'s call-execute-feed-back
//! structure, duplicate-call detection via `seen_calls`/
//! `consecutive_dupes`, iteration cap), generalized from the OpenAI
//! `tool_calls`-array response shape to the Anthropic-style
//! `ClaudeResponse{text, toolUses, stopReason}` shape.

use crate::config::LlmBrainConfig;
use crate::error::{AgentError, AgentErrorKind};
use crate::tools::ToolConfig;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrainStopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone)]
pub struct ClaudeResponse {
    pub text: String,
    pub tool_uses: Vec<ToolUse>,
    pub stop_reason: BrainStopReason,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum BrainMessage {
    User { content: String },
    Assistant { content: Vec<AssistantBlock> },
    #[serde(rename = "user")]
    ToolResult { content: Vec<ToolResultBlock> },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AssistantBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
struct ToolResultBlock {
    #[serde(rename = "type")]
    block_type: &'static str,
    tool_use_id: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponseBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiResponseBlock>,
    stop_reason: BrainStopReason,
}

const MAX_TOOL_LOOP_ITERATIONS: usize = 10;
const MAX_CONSECUTIVE_DUPES: usize = 2;

/// Remote chat/tool client plus the conversation transcript it
/// accumulates for one call. One instance per call; not shared across
/// calls the way `CarrierClient`/`reqwest::Client` are.
pub struct LlmBrain {
    config: LlmBrainConfig,
    client: reqwest::Client,
    history: Mutex<Vec<BrainMessage>>,
}

impl LlmBrain {
    pub fn new(config: LlmBrainConfig) -> Self {
        Self { config, client: reqwest::Client::new(), history: Mutex::new(Vec::new()) }
    }

    /// Send a user turn, return the model's raw response.
    pub async fn respond(&self, user_text: &str) -> Result<ClaudeResponse, AgentError> {
        {
            let mut history = self.history.lock().await;
            history.push(BrainMessage::User { content: user_text.to_string() });
        }
        self.call_api().await
    }

    /// Feed resolved tool outcomes back and get the model's next turn.
    pub async fn handle_tool_results(
        &self,
        results: &[(String, String)],
    ) -> Result<ClaudeResponse, AgentError> {
        {
            let mut history = self.history.lock().await;
            history.push(BrainMessage::ToolResult {
                content: results
                    .iter()
                    .map(|(id, content)| ToolResultBlock {
                        block_type: "tool_result",
                        tool_use_id: id.clone(),
                        content: content.clone(),
                    })
                    .collect(),
            });
        }
        self.call_api().await
    }

    /// Inject an out-of-band system observation (e.g. a carrier event)
    /// using `llm_brain.context_template`, framed as a user turn.
    pub async fn inject_context(&self, text: &str) -> Result<ClaudeResponse, AgentError> {
        let framed = self.config.context_template.replace("{text}", text);
        self.respond(&framed).await
    }

    /// Drive a full turn starting from a user utterance: `respond`,
    /// then resolve any tool use. Returns the final spoken text.
    pub async fn run_turn(&self, user_text: &str, tools: &ToolConfig) -> Result<String, AgentError> {
        let response = self.respond(user_text).await?;
        self.drive_tool_loop(response, tools).await
    }

    /// Drive a full turn starting from an injected out-of-band
    /// context line (spec's "inject via `injectContext` then speak").
    pub async fn run_injected_turn(&self, text: &str, tools: &ToolConfig) -> Result<String, AgentError> {
        let response = self.inject_context(text).await?;
        self.drive_tool_loop(response, tools).await
    }

    /// Loop while `stop_reason == ToolUse`, executing every tool call
    /// against `tools` and feeding the aggregated results back, same
    /// duplicate-call and iteration-cap guards as the teacher's
    /// `run_tool_loop`.
    async fn drive_tool_loop(&self, mut response: ClaudeResponse, tools: &ToolConfig) -> Result<String, AgentError> {
        let mut seen_calls: HashSet<String> = HashSet::new();
        let mut consecutive_dupes = 0usize;

        for _ in 0..MAX_TOOL_LOOP_ITERATIONS {
            if response.stop_reason != BrainStopReason::ToolUse || response.tool_uses.is_empty() {
                return Ok(response.text);
            }

            let call_keys: Vec<String> = response
                .tool_uses
                .iter()
                .map(|t| format!("{}:{}", t.name, t.input))
                .collect();
            if call_keys.iter().all(|k| seen_calls.contains(k)) {
                consecutive_dupes += 1;
                if consecutive_dupes >= MAX_CONSECUTIVE_DUPES {
                    tracing::warn!("llm brain repeating identical tool calls, stopping turn early");
                    return Ok(response.text);
                }
            } else {
                consecutive_dupes = 0;
            }
            for key in call_keys {
                seen_calls.insert(key);
            }

            // spec.md §4.5: "executing each toolUse in parallel and feeding
            // aggregated results back" — run the whole batch concurrently
            // rather than one at a time.
            let calls = join_all(response.tool_uses.iter().map(|tool_use| async move {
                let result = tools.execute(&tool_use.name, tool_use.input.clone()).await;
                (tool_use.id.clone(), result.output)
            }))
            .await;
            response = self.handle_tool_results(&calls).await?;
        }

        tracing::warn!("llm brain hit max tool loop iterations");
        Ok(response.text)
    }

    async fn call_api(&self) -> Result<ClaudeResponse, AgentError> {
        let endpoint = self
            .config
            .endpoint
            .as_deref()
            .ok_or_else(|| AgentError::new(AgentErrorKind::ConnectFailed, "no llm_brain.endpoint configured"))?;

        let history = self.history.lock().await.clone();
        let body = serde_json::json!({
            "model": self.config.model_id,
            "system": self.config.system_prompt,
            "max_tokens": 1024,
            "messages": history,
        });

        let mut req = self.client.post(endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| AgentError::new(AgentErrorKind::StreamError, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AgentError::new(
                AgentErrorKind::ProtocolError,
                format!("llm brain returned {}", resp.status()),
            ));
        }
        let parsed: ApiResponse = resp
            .json()
            .await
            .map_err(|e| AgentError::new(AgentErrorKind::ProtocolError, e.to_string()))?;

        let mut text = String::new();
        let mut tool_uses = Vec::new();
        let mut assistant_blocks = Vec::new();
        for block in parsed.content {
            match block.block_type.as_str() {
                "text" => {
                    let t = block.text.unwrap_or_default();
                    assistant_blocks.push(AssistantBlock::Text { text: t.clone() });
                    text.push_str(&t);
                }
                "tool_use" => {
                    let id = block.id.unwrap_or_default();
                    let name = block.name.unwrap_or_default();
                    let input = block.input.unwrap_or(Value::Null);
                    assistant_blocks.push(AssistantBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    });
                    tool_uses.push(ToolUse { id, name, input });
                }
                other => {
                    tracing::debug!(block_type = other, "dropping unrecognized brain response block");
                }
            }
        }

        self.history.lock().await.push(BrainMessage::Assistant { content: assistant_blocks });

        Ok(ClaudeResponse { text, tool_uses, stop_reason: parsed.stop_reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_stop_reason_decodes_without_error() {
        let json = r#"{"content":[],"stop_reason":"some_future_reason"}"#;
        let parsed: ApiResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.stop_reason, BrainStopReason::Unknown);
    }

    #[test]
    fn context_template_substitutes_text() {
        let config = LlmBrainConfig {
            context_template: "[System: {text}]".to_string(),
            ..LlmBrainConfig::default()
        };
        let framed = config.context_template.replace("{text}", "carrier rang back");
        assert_eq!(framed, "[System: carrier rang back]");
    }
}
