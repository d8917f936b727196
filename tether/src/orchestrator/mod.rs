mod dispatch;
mod events;
mod lifecycle;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::{Mutex, Notify};

use crate::assistant::AssistantLauncher;
use crate::chat::ChatTransport;
use crate::config::OrchestratorConfig;
use crate::directory::DirectoryResolver;
use crate::sequencer::{EventHandler, EventSequencer};
use crate::session::{Attachment, ChatSession, ChatStatus, Rejection, ToolOutput};
use crate::{ChatId, MessageId};

pub use dispatch::{DispatchError, Submitted};
pub use events::HandlerError;
pub use lifecycle::{LifecycleError, SessionStarted};

/// Routes chat prompts to per-chat assistant sessions and relays their
/// events back to the chat.
///
/// Cloning is cheap; clones share all chat state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    config: OrchestratorConfig,
    transport: Arc<dyn ChatTransport>,
    launcher: Arc<dyn AssistantLauncher>,
    directories: Arc<dyn DirectoryResolver>,
    chats: Mutex<HashMap<ChatId, Arc<Mutex<ChatSession>>>>,
    /// Display markers held by live sessions, by chat.
    markers: StdMutex<HashMap<ChatId, String>>,
    sequencer: Arc<EventSequencer>,
    /// Set once shutdown begins; restarts discard what they create.
    shutting_down: AtomicBool,
    /// Woken whenever a restart finishes, successfully or not.
    restarts_settled: Notify,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        transport: Arc<dyn ChatTransport>,
        launcher: Arc<dyn AssistantLauncher>,
        directories: Arc<dyn DirectoryResolver>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let handler: Weak<dyn EventHandler> = weak.clone();
            Inner {
                config,
                transport,
                launcher,
                directories,
                chats: Mutex::new(HashMap::new()),
                markers: StdMutex::new(HashMap::new()),
                sequencer: EventSequencer::new(handler),
                shutting_down: AtomicBool::new(false),
                restarts_settled: Notify::new(),
            }
        });
        Self { inner }
    }

    /// Directories a chat may start a session in. Creates the chat record on
    /// first use.
    pub async fn list_directories(&self, chat_id: &ChatId) -> Vec<PathBuf> {
        self.inner.chat(chat_id).await;
        self.inner.directories.list_directories()
    }

    pub async fn status(&self, chat_id: &ChatId) -> ChatStatus {
        self.inner.chat(chat_id).await.lock().await.status()
    }

    /// Add a file reference to every following prompt of the chat.
    pub async fn attach(&self, chat_id: &ChatId, attachment: Attachment) -> usize {
        let chat = self.inner.chat(chat_id).await;
        let mut chat = chat.lock().await;
        chat.attach(attachment);
        chat.attachments().len()
    }

    pub async fn clear_attachments(&self, chat_id: &ChatId) -> usize {
        self.inner.chat(chat_id).await.lock().await.clear_attachments()
    }

    /// Full output of the tool whose notification is `message_id`.
    pub async fn reveal_tool_output(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
    ) -> Result<ToolOutput, Rejection> {
        let chat = self.inner.chat(chat_id).await;
        let chat = chat.lock().await;
        chat.tool_output(message_id)
            .cloned()
            .ok_or_else(|| Rejection::UnknownToolOutput(message_id.clone()))
    }

    #[cfg(test)]
    pub(crate) fn sequencer(&self) -> &Arc<EventSequencer> {
        &self.inner.sequencer
    }
}

impl Inner {
    /// Chat record for `chat_id`, created on first use.
    async fn chat(&self, chat_id: &ChatId) -> Arc<Mutex<ChatSession>> {
        let mut chats = self.chats.lock().await;
        Arc::clone(chats.entry(chat_id.clone()).or_insert_with(|| {
            tracing::debug!("chat {chat_id}: created");
            Arc::new(Mutex::new(ChatSession::new(
                chat_id.clone(),
                self.config.default_model.clone(),
            )))
        }))
    }

    async fn existing_chat(&self, chat_id: &ChatId) -> Option<Arc<Mutex<ChatSession>>> {
        self.chats.lock().await.get(chat_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PhaseKind;
    use crate::testing::Harness;

    #[tokio::test]
    async fn chats_are_created_lazily_with_default_model() {
        let h = Harness::new();
        let chat = ChatId::from("c");
        let dirs = h.orchestrator.list_directories(&chat).await;
        assert_eq!(dirs, vec![h.dir("alpha"), h.dir("beta")]);

        let status = h.orchestrator.status(&chat).await;
        assert_eq!(status.phase, PhaseKind::NoSession);
        assert_eq!(status.model, "m");
        assert_eq!(status.working_dir, None);
    }

    #[tokio::test]
    async fn chats_keep_independent_state() {
        let h = Harness::new();
        let a = ChatId::from("a");
        let b = ChatId::from("b");
        h.orchestrator
            .start_session(&a, &h.dir("alpha"), Some("model-a"))
            .await
            .unwrap();
        h.orchestrator
            .start_session(&b, &h.dir("beta"), Some("model-b"))
            .await
            .unwrap();

        h.orchestrator.submit(&a, "a1").await.unwrap();
        h.orchestrator.submit(&a, "a2").await.unwrap();

        let status_a = h.orchestrator.status(&a).await;
        let status_b = h.orchestrator.status(&b).await;
        assert_eq!(status_a.phase, PhaseKind::Busy);
        assert_eq!(status_a.queued, 1);
        assert_eq!(status_a.model, "model-a");
        assert_eq!(status_b.phase, PhaseKind::Idle);
        assert_eq!(status_b.queued, 0);
        assert_eq!(status_b.model, "model-b");
        assert_ne!(status_a.marker, status_b.marker);
    }

    #[tokio::test]
    async fn attachments_are_chat_scoped() {
        let h = Harness::new();
        let a = ChatId::from("a");
        let b = ChatId::from("b");
        assert_eq!(h.orchestrator.attach(&a, Attachment::new("/x.png")).await, 1);
        assert_eq!(h.orchestrator.status(&b).await.attachments, 0);
        assert_eq!(h.orchestrator.clear_attachments(&a).await, 1);
    }

    #[tokio::test]
    async fn reveal_unknown_output_is_rejected() {
        let h = Harness::new();
        let err = h
            .orchestrator
            .reveal_tool_output(&ChatId::from("c"), &MessageId::from("m1"))
            .await
            .unwrap_err();
        assert_eq!(err, Rejection::UnknownToolOutput(MessageId::from("m1")));
    }
}
