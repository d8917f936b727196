use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use super::Inner;
use crate::assistant::AssistantEvent;
use crate::chat::{SendOptions, TransportError};
use crate::sequencer::{EventHandler, SequencedEvent};
use crate::session::{ChatSession, TurnEnd};
use crate::ChatId;

const TOOL_SUMMARY_CHARS: usize = 80;

/// Failure while relaying an assistant event to the chat.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[async_trait::async_trait]
impl EventHandler for Inner {
    async fn handle(&self, chat_id: &ChatId, event: SequencedEvent) -> Result<(), HandlerError> {
        let Some(chat) = self.existing_chat(chat_id).await else {
            tracing::debug!("dropping {} for unknown chat {chat_id}", event.event.kind());
            return Ok(());
        };
        let generation = event.generation;
        let Some(marker) = current_marker(&chat, generation).await else {
            tracing::debug!(
                "chat {chat_id}: ignoring {} from replaced session (generation {generation})",
                event.event.kind()
            );
            return Ok(());
        };

        match event.event {
            AssistantEvent::FinalAnswer { text } => {
                self.on_final_answer(chat_id, &chat, generation, &marker, &text)
                    .await
            }
            AssistantEvent::PartialAnswer { delta } => {
                if delta.trim().is_empty() {
                    return Ok(());
                }
                self.transport
                    .send_message(chat_id, &format!("{marker} {delta}"), SendOptions::default())
                    .await?;
                Ok(())
            }
            AssistantEvent::ToolStart {
                event_id,
                tool_call_id,
                tool_name,
                arguments,
            } => {
                let mut text = format!("{marker} 🔧 {tool_name}");
                if let Some(summary) = arguments.as_ref().and_then(summarize_arguments) {
                    text.push_str(": ");
                    text.push_str(&summary);
                }
                let message_id = self
                    .transport
                    .send_message(chat_id, &text, SendOptions::silent())
                    .await?;
                let mut chat = chat.lock().await;
                if chat.is_current(generation) {
                    chat.record_tool_start(tool_call_id.unwrap_or(event_id), message_id, tool_name);
                }
                Ok(())
            }
            AssistantEvent::ToolComplete {
                event_id,
                tool_call_id,
                parent_id,
                success,
                output,
            } => {
                let Some(key) = tool_call_id.or(parent_id) else {
                    tracing::debug!("chat {chat_id}: tool completion {event_id} has no correlation id");
                    return Ok(());
                };
                let message_id = {
                    let mut chat = chat.lock().await;
                    if !chat.is_current(generation) {
                        return Ok(());
                    }
                    chat.complete_tool(&key, success, output)
                };
                match message_id {
                    Some(message_id) => {
                        let reaction = if success { "✅" } else { "❌" };
                        self.transport
                            .set_reaction(chat_id, &message_id, reaction)
                            .await?;
                    }
                    None => tracing::debug!("chat {chat_id}: no tool start recorded for {key}"),
                }
                Ok(())
            }
            AssistantEvent::Idle => self.on_idle(chat_id, &chat, generation, &marker).await,
            AssistantEvent::Error { message } => {
                tracing::warn!("chat {chat_id}: assistant reported: {message}");
                self.transport
                    .send_message(chat_id, &format!("{marker} ⚠️ {message}"), SendOptions::default())
                    .await?;
                Ok(())
            }
        }
    }
}

impl Inner {
    async fn on_final_answer(
        &self,
        chat_id: &ChatId,
        chat: &Mutex<ChatSession>,
        generation: u64,
        marker: &str,
        text: &str,
    ) -> Result<(), HandlerError> {
        let deferred_turn = {
            let mut chat = chat.lock().await;
            if !chat.is_current(generation) {
                return Ok(());
            }
            chat.record_final().then(|| chat.turn_count())
        };
        self.transport
            .send_long_message(chat_id, &format!("{marker} {text}"), SendOptions::markdown())
            .await?;
        if let Some(turn) = deferred_turn {
            self.notify_done(chat_id, marker, turn).await?;
        }
        Ok(())
    }

    /// The turn ended. Sends the queue head before returning, so the next
    /// event for this chat already sees the new turn.
    async fn on_idle(
        &self,
        chat_id: &ChatId,
        chat: &Arc<Mutex<ChatSession>>,
        generation: u64,
        marker: &str,
    ) -> Result<(), HandlerError> {
        let end = {
            let mut chat = chat.lock().await;
            if !chat.is_current(generation) {
                return Ok(());
            }
            chat.finish_turn()
        };
        match end {
            TurnEnd::Next(start) => {
                let turn = start.turn;
                if let Err(failure) = self.send_turn(chat_id, chat, start).await {
                    let mut text = format!(
                        "{marker} ⚠️ Failed to send queued prompt (turn {turn}): {}",
                        failure.error
                    );
                    if failure.discarded > 0 {
                        text.push_str(&format!(
                            "\n{} more queued prompt(s) discarded.",
                            failure.discarded
                        ));
                    }
                    self.transport
                        .send_message(chat_id, &text, SendOptions::default())
                        .await?;
                }
                Ok(())
            }
            TurnEnd::Complete { turn } => self.notify_done(chat_id, marker, turn).await,
            TurnEnd::Deferred => {
                tracing::debug!("chat {chat_id}: idle before final answer, deferring completion");
                Ok(())
            }
            TurnEnd::Ignored => {
                tracing::debug!("chat {chat_id}: idle while no turn is running");
                Ok(())
            }
        }
    }

    async fn notify_done(&self, chat_id: &ChatId, marker: &str, turn: u64) -> Result<(), HandlerError> {
        self.transport
            .send_message(
                chat_id,
                &format!("{marker} ✅ Done (turn {turn})"),
                SendOptions::default(),
            )
            .await?;
        Ok(())
    }
}

async fn current_marker(chat: &Mutex<ChatSession>, generation: u64) -> Option<String> {
    let chat = chat.lock().await;
    if !chat.is_current(generation) {
        return None;
    }
    chat.marker().map(str::to_string)
}

/// One-line description of tool arguments for the start notification.
fn summarize_arguments(arguments: &Value) -> Option<String> {
    let summary = match arguments {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            if map.is_empty() {
                return None;
            }
            ["command", "path", "file", "query", "url"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str))
                .map(str::to_string)
                .unwrap_or_else(|| arguments.to_string())
        }
        other => other.to_string(),
    };
    let line = summary.lines().next().unwrap_or_default().trim();
    if line.is_empty() {
        return None;
    }
    Some(truncate_chars(line, TOOL_SUMMARY_CHARS))
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
