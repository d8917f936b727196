use tokio::sync::Mutex;

use super::{Inner, Orchestrator};
use crate::ChatId;
use crate::assistant::AssistantError;
use crate::session::{Accepted, ChatSession, Rejection, TurnStart};

/// Outcome of an accepted prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submitted {
    /// Sent to the assistant as turn `turn`.
    Sent { turn: u64 },
    /// Another turn is running; the prompt waits at `position` (1-based).
    Queued { position: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    /// The assistant refused the prompt. The chat is idle again; prompts
    /// queued behind it were discarded.
    #[error("failed to send prompt: {source}")]
    Send {
        #[source]
        source: AssistantError,
        discarded: usize,
    },
}

/// A send that failed after the chat was rolled back to idle.
pub(crate) struct SendFailure {
    pub error: AssistantError,
    pub discarded: usize,
}

impl Orchestrator {
    /// Send `text` to the chat's assistant session, or queue it when a turn
    /// is already running.
    ///
    /// Queued prompts keep their raw text; attachments are rendered when the
    /// prompt is finally sent.
    pub async fn submit(&self, chat_id: &ChatId, text: &str) -> Result<Submitted, DispatchError> {
        let chat = self.inner.chat(chat_id).await;
        let accepted = chat.lock().await.accept_prompt(text)?;
        match accepted {
            Accepted::Queued { position } => {
                tracing::debug!("chat {chat_id}: prompt queued at position {position}");
                Ok(Submitted::Queued { position })
            }
            Accepted::Send(start) => {
                let turn = start.turn;
                self.inner
                    .send_turn(chat_id, &chat, start)
                    .await
                    .map_err(|failure| DispatchError::Send {
                        source: failure.error,
                        discarded: failure.discarded,
                    })?;
                Ok(Submitted::Sent { turn })
            }
        }
    }
}

impl Inner {
    /// Deliver a started turn. The chat lock is not held during the send; on
    /// failure the chat is rolled back to idle.
    pub(crate) async fn send_turn(
        &self,
        chat_id: &ChatId,
        chat: &Mutex<ChatSession>,
        start: TurnStart,
    ) -> Result<(), SendFailure> {
        tracing::info!(
            "chat {chat_id}: sending turn {} ({} chars)",
            start.turn,
            start.prompt.len()
        );
        match start.session.send(&start.prompt).await {
            Ok(()) => Ok(()),
            Err(error) => {
                let discarded = chat.lock().await.rollback_send(start.generation);
                tracing::warn!("chat {chat_id}: send failed for turn {}: {error}", start.turn);
                Err(SendFailure { error, discarded })
            }
        }
    }
}
