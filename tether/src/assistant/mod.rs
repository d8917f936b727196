mod process;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::sequencer::SessionEvents;

pub use process::ProcessLauncher;

/// Error codes the assistant transport reports when a connection is torn
/// down underneath an in-flight call. Seen during teardown races only.
pub const DISPOSAL_RACE_CODES: &[&str] = &["connection_disposed", "EPIPE", "ERR_STREAM_DESTROYED"];

/// Which assistant operation failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssistantErrorKind {
    Launch,
    Create,
    Send,
    Abort,
    Dispose,
    Transport,
    Protocol,
}

impl fmt::Display for AssistantErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssistantErrorKind::Launch => "launch",
            AssistantErrorKind::Create => "create",
            AssistantErrorKind::Send => "send",
            AssistantErrorKind::Abort => "abort",
            AssistantErrorKind::Dispose => "dispose",
            AssistantErrorKind::Transport => "transport",
            AssistantErrorKind::Protocol => "protocol",
        };
        f.write_str(name)
    }
}

/// Structured failure reported by an assistant client or session.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("assistant {kind} error: {message}")]
pub struct AssistantError {
    pub kind: AssistantErrorKind,
    pub code: Option<String>,
    pub message: String,
}

impl AssistantError {
    pub fn new(kind: AssistantErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Known transport race: the underlying connection was already disposed
    /// when a destroy/stop call reached it. Safe to ignore during teardown.
    pub fn is_disposal_race(&self) -> bool {
        matches!(
            self.kind,
            AssistantErrorKind::Dispose | AssistantErrorKind::Transport
        ) && self
            .code
            .as_deref()
            .is_some_and(|code| DISPOSAL_RACE_CODES.contains(&code))
    }
}

/// Events emitted by an assistant session during a turn.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum AssistantEvent {
    #[serde(rename = "final_answer")]
    FinalAnswer { text: String },
    #[serde(rename = "partial_answer")]
    PartialAnswer { delta: String },
    #[serde(rename = "tool_start")]
    ToolStart {
        event_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<serde_json::Value>,
    },
    #[serde(rename = "tool_complete")]
    ToolComplete {
        event_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        success: bool,
        #[serde(default)]
        output: String,
    },
    #[serde(rename = "idle")]
    Idle,
    #[serde(rename = "error")]
    Error { message: String },
}

impl AssistantEvent {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AssistantEvent::FinalAnswer { .. } => "final_answer",
            AssistantEvent::PartialAnswer { .. } => "partial_answer",
            AssistantEvent::ToolStart { .. } => "tool_start",
            AssistantEvent::ToolComplete { .. } => "tool_complete",
            AssistantEvent::Idle => "idle",
            AssistantEvent::Error { .. } => "error",
        }
    }
}

/// Starts assistant clients rooted in a working directory.
///
/// One client is launched per chat session, so each chat gets its own
/// working directory without touching process-wide state.
#[async_trait::async_trait]
pub trait AssistantLauncher: Send + Sync {
    async fn launch(&self, working_dir: &Path) -> Result<Box<dyn AssistantClient>, AssistantError>;
}

/// A running assistant process.
#[async_trait::async_trait]
pub trait AssistantClient: Send + Sync {
    /// Open a conversational session. Events for the session are delivered
    /// through `events` for as long as the session lives.
    async fn create_session(
        &self,
        model: &str,
        events: SessionEvents,
    ) -> Result<Arc<dyn AssistantSession>, AssistantError>;

    /// Stop the client. Called after every session it owns is destroyed.
    async fn stop(&self) -> Result<(), AssistantError>;
}

/// Handle to a single assistant conversation.
#[async_trait::async_trait]
pub trait AssistantSession: Send + Sync {
    fn id(&self) -> &str;

    /// Submit a prompt. Returns once the assistant accepted it; output arrives
    /// as events.
    async fn send(&self, prompt: &str) -> Result<(), AssistantError>;

    /// Ask the assistant to stop the in-flight turn. No guarantee that
    /// events stop immediately.
    async fn abort(&self) -> Result<(), AssistantError>;

    async fn destroy(&self) -> Result<(), AssistantError>;
}
