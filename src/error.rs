//! Error taxonomy for the call bridge
//!
//! Domain errors are typed (`thiserror`) so callers can match on `kind`;
//! everything else propagates through `anyhow::Result` with `.context(...)`
//! exactly as the rest of the crate does.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0:?}")]
    MissingRequired(Vec<String>),
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarrierErrorKind {
    PlaceFailed,
    HangupFailed,
    ParseFailed,
}

#[derive(Debug, Error)]
#[error("carrier error ({kind:?}): {detail}")]
pub struct CarrierError {
    pub kind: CarrierErrorKind,
    pub detail: String,
}

impl CarrierError {
    pub fn new(kind: CarrierErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    BadSignature,
    BadToken,
    StaleTimestamp,
}

#[derive(Debug, Error)]
#[error("auth error: {kind:?}")]
pub struct AuthError {
    pub kind: AuthErrorKind,
}

impl AuthError {
    pub fn new(kind: AuthErrorKind) -> Self {
        Self { kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaErrorKind {
    NotReady,
    SocketClosed,
}

#[derive(Debug, Error)]
#[error("media error: {kind:?}")]
pub struct MediaError {
    pub kind: MediaErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentErrorKind {
    ConnectFailed,
    StreamError,
    ProtocolError,
}

#[derive(Debug, Error)]
#[error("agent error ({kind:?}): {detail}")]
pub struct AgentError {
    pub kind: AgentErrorKind,
    pub detail: String,
}

impl AgentError {
    pub fn new(kind: AgentErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }
}

#[derive(Debug, Error)]
#[error("timeout waiting for {what}")]
pub struct TimeoutError {
    pub what: String,
}

impl TimeoutError {
    pub fn new(what: impl Into<String>) -> Self {
        Self { what: what.into() }
    }
}

#[derive(Debug, Error)]
#[error("call was hung up")]
pub struct HangupError;

#[derive(Debug, Error)]
#[error("tool '{name}' failed: {cause}")]
pub struct ToolError {
    pub name: String,
    pub cause: String,
}

#[derive(Debug, Error)]
#[error("no session found for call_id '{0}'")]
pub struct SessionNotFound(pub String);

/// Top-level error type returned from session-facing operations
/// (`start`, `inject`, `speak`, `end`). Each variant maps to one RPC
/// error text returned to the Driver, per spec §7's propagation policy.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Carrier(#[from] CarrierError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Hangup(#[from] HangupError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    NotFound(#[from] SessionNotFound),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    /// Short textual explanation suitable for crossing the RPC boundary.
    /// Never includes a backtrace or `Debug` formatting.
    pub fn driver_text(&self) -> String {
        self.to_string()
    }
}
