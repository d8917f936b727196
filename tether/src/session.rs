//! Per-chat session state machine.
//!
//! ```text
//! NoSession ──start──▶ Idle ──prompt──▶ Busy ──idle, queue empty──▶ Idle
//!     ▲                  │               │ ▲
//!     │                  │               └─┘ idle, queue non-empty: send head
//!     │                  └──reset/switch─┬──────────────┐
//!     └───────create failed──────── Resetting ──created──▶ Idle
//! ```
//!
//! Transitions are methods that either return what the caller must do next
//! (send a prompt, emit a notice) or a [`Rejection`]. I/O happens outside,
//! with the chat lock released.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};

use crate::assistant::{AssistantClient, AssistantSession};
use crate::{ChatId, MessageId};

/// Request refused without side effects; reported straight back to the chat.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("no active session, choose a working directory first")]
    NoActiveSession,
    #[error("session is being reset, please wait")]
    ResetInProgress,
    #[error("invalid selection {index}, expected a number from 1 to {available}")]
    InvalidSelection { index: usize, available: usize },
    #[error("no stored tool output for message {0}")]
    UnknownToolOutput(MessageId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    NoSession,
    Idle,
    Busy { current_prompt: String },
    Resetting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseKind {
    NoSession,
    Idle,
    Busy,
    Resetting,
}

impl Phase {
    pub fn kind(&self) -> PhaseKind {
        match self {
            Phase::NoSession => PhaseKind::NoSession,
            Phase::Idle => PhaseKind::Idle,
            Phase::Busy { .. } => PhaseKind::Busy,
            Phase::Resetting => PhaseKind::Resetting,
        }
    }
}

/// A file reference attached to upcoming prompts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub path: PathBuf,
}

impl Attachment {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn is_image(&self) -> bool {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .is_some_and(|ext| matches!(ext.as_str(), "png" | "jpg" | "jpeg" | "gif" | "webp"))
    }
}

/// Prompt text as sent to the assistant: the user's text followed by the
/// current attachment list.
pub fn render_prompt(text: &str, attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return text.to_string();
    }
    let mut prompt = format!("{text}\n\nAttached files:");
    for attachment in attachments {
        prompt.push_str(&format!("\n- {}", attachment.path.display()));
        if attachment.is_image() {
            prompt.push_str(" (image)");
        }
    }
    prompt
}

/// A running assistant session together with the client that owns it.
pub struct LiveSession {
    pub(crate) client: Box<dyn AssistantClient>,
    pub(crate) session: Arc<dyn AssistantSession>,
    pub(crate) working_dir: PathBuf,
    pub(crate) generation: u64,
    pub(crate) marker: String,
    pub(crate) started_at: DateTime<Local>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ToolStatus {
    Running,
    Succeeded,
    Failed,
}

struct ToolCorrelation {
    message_id: MessageId,
    tool_name: String,
    status: ToolStatus,
}

/// Full result of a tool call, kept for on-demand reveal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolOutput {
    pub tool_name: String,
    pub success: bool,
    pub output: String,
}

/// Everything needed to send one prompt after the chat lock is released.
pub(crate) struct TurnStart {
    pub session: Arc<dyn AssistantSession>,
    pub prompt: String,
    pub turn: u64,
    pub generation: u64,
}

pub(crate) enum Accepted {
    Send(TurnStart),
    Queued { position: usize },
}

/// What the idle handler must do after a turn ends.
pub(crate) enum TurnEnd {
    /// Queue head popped; send it. The chat stays busy.
    Next(TurnStart),
    /// Emit the completion notice now.
    Complete { turn: u64 },
    /// Final answer still outstanding; the notice follows it.
    Deferred,
    /// Not busy; nothing to do.
    Ignored,
}

/// Read-only snapshot for status displays.
#[derive(Clone, Debug)]
pub struct ChatStatus {
    pub chat_id: ChatId,
    pub phase: PhaseKind,
    pub model: String,
    pub working_dir: Option<PathBuf>,
    pub marker: Option<String>,
    pub current_prompt: Option<String>,
    pub queued: usize,
    pub turn_count: u64,
    pub attachments: usize,
    /// Tool calls started but not yet completed.
    pub running_tools: usize,
    pub session_started_at: Option<DateTime<Local>>,
}

pub struct ChatSession {
    chat_id: ChatId,
    phase: Phase,
    live: Option<LiveSession>,
    model: String,
    prompt_queue: VecDeque<String>,
    turn_count: u64,
    attachments: Vec<Attachment>,
    /// Turns sent whose final answer has not arrived yet. A late answer for
    /// an earlier turn can land after the next queued turn started.
    finals_pending: u64,
    completion_deferred: bool,
    generations: u64,
    tools: HashMap<String, ToolCorrelation>,
    tool_outputs: HashMap<MessageId, ToolOutput>,
}

impl ChatSession {
    pub fn new(chat_id: ChatId, model: impl Into<String>) -> Self {
        Self {
            chat_id,
            phase: Phase::NoSession,
            live: None,
            model: model.into(),
            prompt_queue: VecDeque::new(),
            turn_count: 0,
            attachments: Vec::new(),
            finals_pending: 0,
            completion_deferred: false,
            generations: 0,
            tools: HashMap::new(),
            tool_outputs: HashMap::new(),
        }
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.live.as_ref().map(|live| live.working_dir.as_path())
    }

    pub fn marker(&self) -> Option<&str> {
        self.live.as_ref().map(|live| live.marker.as_str())
    }

    pub fn queued_prompts(&self) -> impl Iterator<Item = &str> {
        self.prompt_queue.iter().map(String::as_str)
    }

    pub fn turn_count(&self) -> u64 {
        self.turn_count
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn has_session(&self) -> bool {
        self.live.is_some()
    }

    /// Whether `generation` belongs to the session currently installed.
    pub fn is_current(&self, generation: u64) -> bool {
        self.live
            .as_ref()
            .is_some_and(|live| live.generation == generation)
    }

    pub fn status(&self) -> ChatStatus {
        ChatStatus {
            chat_id: self.chat_id.clone(),
            phase: self.phase.kind(),
            model: self.model.clone(),
            working_dir: self.working_dir().map(Path::to_path_buf),
            marker: self.marker().map(str::to_string),
            current_prompt: match &self.phase {
                Phase::Busy { current_prompt } => Some(current_prompt.clone()),
                _ => None,
            },
            queued: self.prompt_queue.len(),
            turn_count: self.turn_count,
            attachments: self.attachments.len(),
            running_tools: self
                .tools
                .values()
                .filter(|tool| tool.status == ToolStatus::Running)
                .count(),
            session_started_at: self.live.as_ref().map(|live| live.started_at),
        }
    }

    // ── Prompts ──

    /// Idle: start a turn. Busy: queue the raw text. Otherwise reject.
    pub(crate) fn accept_prompt(&mut self, text: &str) -> Result<Accepted, Rejection> {
        match self.phase {
            Phase::NoSession => Err(Rejection::NoActiveSession),
            Phase::Resetting => Err(Rejection::ResetInProgress),
            Phase::Busy { .. } => {
                self.prompt_queue.push_back(text.to_string());
                Ok(Accepted::Queued {
                    position: self.prompt_queue.len(),
                })
            }
            Phase::Idle => self.start_turn(text.to_string()).map(Accepted::Send),
        }
    }

    fn start_turn(&mut self, text: String) -> Result<TurnStart, Rejection> {
        let Some(live) = self.live.as_ref() else {
            return Err(Rejection::NoActiveSession);
        };
        let start = TurnStart {
            session: Arc::clone(&live.session),
            prompt: render_prompt(&text, &self.attachments),
            turn: self.turn_count + 1,
            generation: live.generation,
        };
        self.turn_count += 1;
        self.finals_pending += 1;
        self.completion_deferred = false;
        self.phase = Phase::Busy {
            current_prompt: text,
        };
        Ok(start)
    }

    /// Undo a turn whose send failed. Queued prompts are discarded, since
    /// the chat returns to idle; their count is returned.
    pub(crate) fn rollback_send(&mut self, generation: u64) -> usize {
        if !self.is_current(generation) || self.phase.kind() != PhaseKind::Busy {
            return 0;
        }
        self.phase = Phase::Idle;
        // the failed turn will never answer
        self.finals_pending = self.finals_pending.saturating_sub(1);
        self.completion_deferred = false;
        let dropped = self.prompt_queue.len();
        self.prompt_queue.clear();
        dropped
    }

    /// The assistant went idle. Pops the next queued prompt if any.
    pub(crate) fn finish_turn(&mut self) -> TurnEnd {
        if self.phase.kind() != PhaseKind::Busy {
            return TurnEnd::Ignored;
        }
        self.phase = Phase::Idle;
        if let Some(next) = self.prompt_queue.pop_front() {
            return match self.start_turn(next) {
                Ok(start) => TurnEnd::Next(start),
                Err(_) => TurnEnd::Ignored,
            };
        }
        if self.finals_pending > 0 {
            self.completion_deferred = true;
            TurnEnd::Deferred
        } else {
            TurnEnd::Complete {
                turn: self.turn_count,
            }
        }
    }

    /// A final answer arrived for the oldest unanswered turn. Returns true
    /// when it was the last one outstanding and a completion notice was
    /// deferred for it.
    pub(crate) fn record_final(&mut self) -> bool {
        self.finals_pending = self.finals_pending.saturating_sub(1);
        let emit = self.completion_deferred
            && self.finals_pending == 0
            && self.phase == Phase::Idle
            && self.prompt_queue.is_empty();
        if emit {
            self.completion_deferred = false;
        }
        emit
    }

    // ── Lifecycle ──

    /// Enter `Resetting` to replace the session (directory or model switch).
    /// Returns the old session, which the caller tears down.
    pub(crate) fn begin_switch(&mut self) -> Result<Option<LiveSession>, Rejection> {
        if self.phase == Phase::Resetting {
            return Err(Rejection::ResetInProgress);
        }
        self.prompt_queue.clear();
        self.phase = Phase::Resetting;
        Ok(self.live.take())
    }

    /// Enter `Resetting` to restart the current session in place. Returns the
    /// old session; its directory and the current model are reused.
    pub(crate) fn begin_reset(&mut self) -> Result<LiveSession, Rejection> {
        match self.phase {
            Phase::Resetting => return Err(Rejection::ResetInProgress),
            Phase::NoSession => return Err(Rejection::NoActiveSession),
            Phase::Idle | Phase::Busy { .. } => {}
        }
        let Some(live) = self.live.take() else {
            return Err(Rejection::NoActiveSession);
        };
        self.prompt_queue.clear();
        self.turn_count = 0;
        self.phase = Phase::Resetting;
        Ok(live)
    }

    pub(crate) fn next_generation(&mut self) -> u64 {
        self.generations += 1;
        self.generations
    }

    /// `Resetting → Idle` with a fresh session.
    pub(crate) fn install_session(&mut self, live: LiveSession, model: String) {
        self.live = Some(live);
        self.model = model;
        self.phase = Phase::Idle;
        self.reset_turn_state();
    }

    /// `→ NoSession`. Returns the session that was installed, if any.
    pub(crate) fn clear_session(&mut self) -> Option<LiveSession> {
        self.phase = Phase::NoSession;
        self.reset_turn_state();
        self.live.take()
    }

    fn reset_turn_state(&mut self) {
        self.prompt_queue.clear();
        self.finals_pending = 0;
        self.completion_deferred = false;
        self.tools.clear();
        self.tool_outputs.clear();
    }

    pub(crate) fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    // ── Attachments ──

    pub fn attach(&mut self, attachment: Attachment) {
        if !self.attachments.contains(&attachment) {
            self.attachments.push(attachment);
        }
    }

    pub fn clear_attachments(&mut self) -> usize {
        std::mem::take(&mut self.attachments).len()
    }

    // ── Tool correlation ──

    pub(crate) fn record_tool_start(&mut self, key: String, message_id: MessageId, tool_name: String) {
        self.tools.insert(
            key,
            ToolCorrelation {
                message_id,
                tool_name,
                status: ToolStatus::Running,
            },
        );
    }

    /// Resolve a completed tool against its start notification. Returns the
    /// notification to react on.
    pub(crate) fn complete_tool(
        &mut self,
        key: &str,
        success: bool,
        output: String,
    ) -> Option<MessageId> {
        let entry = self.tools.get_mut(key)?;
        entry.status = if success {
            ToolStatus::Succeeded
        } else {
            ToolStatus::Failed
        };
        self.tool_outputs.insert(
            entry.message_id.clone(),
            ToolOutput {
                tool_name: entry.tool_name.clone(),
                success,
                output,
            },
        );
        Some(entry.message_id.clone())
    }

    pub fn tool_output(&self, message_id: &MessageId) -> Option<&ToolOutput> {
        self.tool_outputs.get(message_id)
    }
}
