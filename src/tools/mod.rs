//! Tool interface. Bodies are out of scope per spec.md §1 — only the
//! `(name, inputObject) -> (outputString, isError)` executor contract
//! and one illustrative executor are specified. Grounded on the
//! teacher's `src/agent/tools.rs` (`Tool`/`ToolContext`/`ToolResult`),
//! trimmed down to the interface.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// One entry of the process-lifetime tool set advertised to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

pub struct ToolResult {
    pub output: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self { output: output.into(), is_error: false }
    }

    /// Per spec §7: tool errors are returned to the agent as a result
    /// string beginning with `Error: `; they never kill the session.
    pub fn error(cause: impl Into<String>) -> Self {
        Self { output: format!("Error: {}", cause.into()), is_error: true }
    }
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, input: Value) -> ToolResult;
}

/// The process-wide, read-only set of tools plus their executors.
/// Built once at startup and shared across all sessions.
pub struct ToolConfig {
    specs: Vec<ToolSpec>,
    executors: HashMap<String, Box<dyn ToolExecutor>>,
    deadline: Duration,
}

impl ToolConfig {
    pub fn new(deadline: Duration) -> Self {
        Self { specs: Vec::new(), executors: HashMap::new(), deadline }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        executor: impl ToolExecutor + 'static,
    ) {
        let name = name.into();
        self.specs.push(ToolSpec {
            name: name.clone(),
            description: description.into(),
            input_schema,
        });
        self.executors.insert(name, Box::new(executor));
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    /// Run the named tool's executor with a deadline. A timeout or
    /// unknown tool name both surface as a `ToolResult::error` — never
    /// a panic or a killed session.
    pub async fn execute(&self, name: &str, input: Value) -> ToolResult {
        let Some(executor) = self.executors.get(name) else {
            return ToolResult::error(format!("unknown tool '{name}'"));
        };
        match tokio::time::timeout(self.deadline, executor.execute(input)).await {
            Ok(result) => result,
            Err(_) => ToolResult::error(format!("tool '{name}' timed out")),
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// Illustrative example executor used by spec.md §8 scenario S3: a
/// stub health check with no external dependency.
pub struct ServiceHealthExecutor;

#[async_trait]
impl ToolExecutor for ServiceHealthExecutor {
    async fn execute(&self, input: Value) -> ToolResult {
        let service = input.get("service").and_then(Value::as_str).unwrap_or("all");
        match service {
            "all" => ToolResult::ok("api: healthy\nqueue: healthy"),
            "api" => ToolResult::ok("api: healthy"),
            "queue" => ToolResult::ok("queue: healthy"),
            other => ToolResult::error(format!("unknown service '{other}'")),
        }
    }
}

pub fn default_tool_config() -> ToolConfig {
    let mut config = ToolConfig::default();
    config.register(
        "service_health",
        "Report health of backend services (api, queue, or all).",
        serde_json::json!({
            "type": "object",
            "properties": {
                "service": { "type": "string", "enum": ["all", "api", "queue"] }
            }
        }),
        ServiceHealthExecutor,
    );
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn service_health_reports_all_by_default() {
        let config = default_tool_config();
        let result = config.execute("service_health", serde_json::json!({})).await;
        assert!(!result.is_error);
        assert_eq!(result.output, "api: healthy\nqueue: healthy");
    }

    #[tokio::test]
    async fn unknown_tool_name_returns_error_result_without_panicking() {
        let config = default_tool_config();
        let result = config.execute("not_a_tool", serde_json::json!({})).await;
        assert!(result.is_error);
        assert!(result.output.starts_with("Error: "));
    }
}
