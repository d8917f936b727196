pub mod assistant;
pub mod chat;
pub mod config;
pub mod directory;
pub mod orchestrator;
pub mod sequencer;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use assistant::{
    AssistantClient, AssistantError, AssistantErrorKind, AssistantEvent, AssistantLauncher,
    AssistantSession, ProcessLauncher,
};
pub use chat::{ChatTransport, SendOptions, TextFormat, TransportError};
pub use config::{OrchestratorConfig, TetherConfig};
pub use directory::{DirectoryResolver, PatternResolver};
pub use orchestrator::{
    DispatchError, HandlerError, LifecycleError, Orchestrator, SessionStarted, Submitted,
};
pub use sequencer::{EventSequencer, SequencedEvent, SessionEvents};
pub use session::{
    Attachment, ChatSession, ChatStatus, Phase, PhaseKind, Rejection, ToolOutput,
};

use std::fmt;

/// Opaque, stable identifier of an external chat.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatId(String);

impl ChatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChatId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<i64> for ChatId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of a message previously delivered by a [`ChatTransport`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
