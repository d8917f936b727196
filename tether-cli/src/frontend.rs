use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use tether_core::{
    Attachment, ChatId, ChatStatus, ChatTransport, DispatchError, MessageId, Orchestrator,
    PhaseKind, SendOptions, SessionStarted, Submitted,
};

use crate::command::{self, Command};

#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Translates console input for one chat into orchestrator calls and reports
/// the outcome back through the chat transport.
pub struct Frontend {
    orchestrator: Orchestrator,
    transport: Arc<dyn ChatTransport>,
    chat: ChatId,
}

impl Frontend {
    pub fn new(orchestrator: Orchestrator, transport: Arc<dyn ChatTransport>, chat: ChatId) -> Self {
        Self {
            orchestrator,
            transport,
            chat,
        }
    }

    pub async fn greet(&self) {
        let dirs = self.orchestrator.list_directories(&self.chat).await;
        if dirs.is_empty() {
            self.reply("No working directories configured. Add patterns to the config or pass --dir.")
                .await;
        } else {
            self.reply(&format_directories(&dirs)).await;
        }
    }

    pub async fn handle_line(&self, line: &str) -> Flow {
        let line = line.trim();
        if line.is_empty() {
            return Flow::Continue;
        }
        match command::parse(line) {
            Some(Command::Exit) => return Flow::Exit,
            Some(cmd) => self.run(cmd).await,
            None => self.submit(line).await,
        }
        Flow::Continue
    }

    async fn run(&self, cmd: Command) {
        let chat = &self.chat;
        match cmd {
            Command::Dirs => {
                let dirs = self.orchestrator.list_directories(chat).await;
                if dirs.is_empty() {
                    self.reply("No working directories found.").await;
                } else {
                    self.reply(&format_directories(&dirs)).await;
                }
            }
            Command::Cd(index) => match self.orchestrator.select_directory(chat, index).await {
                Ok(started) => self.reply(&format_started(&started)).await,
                Err(e) => self.reply(&format!("⚠️ {e}")).await,
            },
            Command::Model(model) => match self.orchestrator.set_model(chat, &model).await {
                Ok(Some(started)) => self.reply(&format_started(&started)).await,
                Ok(None) => self.reply(&format!("Model set to {model}.")).await,
                Err(e) => self.reply(&format!("⚠️ {e}")).await,
            },
            Command::Reset => {
                self.reply("🔄 Resetting session...").await;
                match self.orchestrator.reset_session(chat).await {
                    Ok(started) => self.reply(&format_started(&started)).await,
                    Err(e) => self.reply(&format!("⚠️ Reset failed: {e}")).await,
                }
            }
            Command::Attach(path) => {
                let path = std::path::absolute(&path).unwrap_or(path);
                if !path.is_file() {
                    self.reply(&format!("⚠️ Not a file: {}", path.display()))
                        .await;
                    return;
                }
                let count = self
                    .orchestrator
                    .attach(chat, Attachment::new(path.clone()))
                    .await;
                self.reply(&format!("📎 Attached {} ({count} total)", path.display()))
                    .await;
            }
            Command::Detach => {
                let cleared = self.orchestrator.clear_attachments(chat).await;
                self.reply(&format!("Cleared {cleared} attachment(s).")).await;
            }
            Command::Show(id) => {
                match self
                    .orchestrator
                    .reveal_tool_output(chat, &MessageId::new(id))
                    .await
                {
                    Ok(output) => {
                        let status = if output.success { "✅" } else { "❌" };
                        let text = format!("{status} {}\n{}", output.tool_name, output.output);
                        if let Err(e) = self
                            .transport
                            .send_long_message(chat, &text, SendOptions::default())
                            .await
                        {
                            tracing::warn!("failed to show tool output: {e}");
                        }
                    }
                    Err(e) => self.reply(&format!("⚠️ {e}")).await,
                }
            }
            Command::Status => {
                let status = self.orchestrator.status(chat).await;
                self.reply(&format_status(&status)).await;
            }
            Command::Help => self.reply(&command::help_text()).await,
            Command::Usage(usage) => self.reply(&format!("Usage: {usage}")).await,
            Command::Unknown(name) => {
                self.reply(&format!("Unknown command /{name}. Type /help for a list."))
                    .await
            }
            Command::Exit => {}
        }
    }

    async fn submit(&self, text: &str) {
        match self.orchestrator.submit(&self.chat, text).await {
            Ok(Submitted::Sent { turn }) => tracing::debug!("prompt sent as turn {turn}"),
            Ok(Submitted::Queued { position }) => {
                self.reply(&format!("⏳ Queued (position {position})")).await
            }
            Err(DispatchError::Rejected(rejection)) => self.reply(&format!("⚠️ {rejection}")).await,
            Err(DispatchError::Send { source, discarded }) => {
                let mut text = format!("⚠️ Failed to send prompt: {source}");
                if discarded > 0 {
                    text.push_str(&format!("\n{discarded} queued prompt(s) discarded."));
                }
                self.reply(&text).await;
            }
        }
    }

    async fn reply(&self, text: &str) {
        if let Err(e) = self
            .transport
            .send_message(&self.chat, text, SendOptions::default())
            .await
        {
            tracing::warn!("failed to reply to chat {}: {e}", self.chat);
        }
    }
}

fn format_directories(dirs: &[PathBuf]) -> String {
    let mut text = String::from("Working directories:");
    for (i, dir) in dirs.iter().enumerate() {
        text.push_str(&format!("\n  {}. {}", i + 1, dir.display()));
    }
    text.push_str("\nChoose one with /cd N.");
    text
}

fn format_started(started: &SessionStarted) -> String {
    format!(
        "{} Session ready in {} ({})",
        started.marker,
        started.working_dir.display(),
        started.model
    )
}

fn format_status(status: &ChatStatus) -> String {
    let state = match status.phase {
        PhaseKind::NoSession => "no session",
        PhaseKind::Idle => "idle",
        PhaseKind::Busy => "busy",
        PhaseKind::Resetting => "resetting",
    };
    let mut lines = vec![format!(
        "{} {state}",
        status.marker.as_deref().unwrap_or("○")
    )];
    lines.push(format!("model: {}", status.model));
    if let Some(dir) = &status.working_dir {
        lines.push(format!("directory: {}", dir.display()));
    }
    if let Some(started_at) = status.session_started_at {
        let uptime = (Local::now() - started_at).num_seconds().max(0);
        lines.push(format!("uptime: {}", format_uptime(uptime as u64)));
    }
    if let Some(prompt) = &status.current_prompt {
        lines.push(format!("running: {prompt}"));
    }
    if status.running_tools > 0 {
        lines.push(format!("tools running: {}", status.running_tools));
    }
    lines.push(format!(
        "turns: {}, queued: {}, attachments: {}",
        status.turn_count, status.queued, status.attachments
    ));
    lines.join("\n")
}

fn format_uptime(secs: u64) -> String {
    match secs {
        0..60 => format!("{secs}s"),
        60..3_600 => format!("{}m {}s", secs / 60, secs % 60),
        _ => format!("{}h {}m", secs / 3_600, (secs % 3_600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(phase: PhaseKind) -> ChatStatus {
        ChatStatus {
            chat_id: ChatId::from("console"),
            phase,
            model: "m".into(),
            working_dir: None,
            marker: None,
            current_prompt: None,
            queued: 0,
            turn_count: 0,
            attachments: 0,
            running_tools: 0,
            session_started_at: None,
        }
    }

    #[test]
    fn directories_are_numbered_from_one() {
        let text = format_directories(&[PathBuf::from("/a"), PathBuf::from("/b")]);
        assert!(text.contains("  1. /a\n  2. /b"));
    }

    #[test]
    fn status_without_session() {
        assert_eq!(
            format_status(&status(PhaseKind::NoSession)),
            "○ no session\nmodel: m\nturns: 0, queued: 0, attachments: 0"
        );
    }

    #[test]
    fn status_of_busy_session() {
        let status = ChatStatus {
            working_dir: Some(PathBuf::from("/w")),
            marker: Some("🟢".into()),
            current_prompt: Some("task1".into()),
            queued: 2,
            turn_count: 3,
            running_tools: 1,
            ..status(PhaseKind::Busy)
        };
        let text = format_status(&status);
        assert!(text.starts_with("🟢 busy\nmodel: m\ndirectory: /w"));
        assert!(text.contains("running: task1\ntools running: 1\n"));
        assert!(text.ends_with("turns: 3, queued: 2, attachments: 0"));
    }

    #[test]
    fn uptime_units() {
        assert_eq!(format_uptime(42), "42s");
        assert_eq!(format_uptime(133), "2m 13s");
        assert_eq!(format_uptime(3_900), "1h 5m");
    }
}
