use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{
    AssistantClient, AssistantError, AssistantErrorKind, AssistantEvent, AssistantLauncher,
    AssistantSession,
};
use crate::sequencer::SessionEvents;

/// How long `stop()` waits for the process to exit after stdin closes.
const STOP_GRACE: Duration = Duration::from_secs(2);

type Routes = Arc<StdMutex<HashMap<String, SessionEvents>>>;

/// One line of assistant output: an event tagged with its session.
#[derive(serde::Deserialize)]
struct Envelope {
    session_id: String,
    #[serde(flatten)]
    event: AssistantEvent,
}

/// Launches an assistant that speaks JSON lines over stdio.
///
/// Requests written to the child's stdin:
/// `create_session`, `send`, `abort`, `destroy`, each carrying `session_id`.
/// The child answers with one [`AssistantEvent`] per stdout line, plus a
/// `session_id` field.
pub struct ProcessLauncher {
    command: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait::async_trait]
impl AssistantLauncher for ProcessLauncher {
    async fn launch(&self, working_dir: &Path) -> Result<Box<dyn AssistantClient>, AssistantError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(AssistantError::new(
                AssistantErrorKind::Launch,
                "no assistant command configured",
            ));
        };
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AssistantError::new(
                    AssistantErrorKind::Launch,
                    format!("failed to spawn {program}: {e}"),
                )
            })?;
        tracing::info!(
            "launched assistant pid={:?} in {}",
            child.id(),
            working_dir.display()
        );

        let routes: Routes = Arc::default();
        let cancel = CancellationToken::new();
        spawn_readers(
            child.stdout.take(),
            child.stderr.take(),
            routes.clone(),
            cancel.clone(),
        );

        Ok(Box::new(ProcessClient {
            writer: Arc::new(Writer {
                stdin: Mutex::new(child.stdin.take()),
            }),
            child: Mutex::new(Some(child)),
            routes,
            cancel,
        }))
    }
}

/// Shared, line-oriented writer for the child's stdin.
struct Writer {
    stdin: Mutex<Option<ChildStdin>>,
}

impl Writer {
    async fn write(
        &self,
        kind: AssistantErrorKind,
        request: serde_json::Value,
    ) -> Result<(), AssistantError> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(AssistantError::new(kind, "connection is disposed")
                .with_code("connection_disposed"));
        };
        let mut line = request.to_string();
        line.push('\n');
        let result: std::io::Result<()> = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        result.map_err(|e| {
            let err = AssistantError::new(kind, e.to_string());
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                err.with_code("EPIPE")
            } else {
                err
            }
        })
    }

    async fn close(&self) {
        self.stdin.lock().await.take();
    }
}

fn spawn_readers(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    routes: Routes,
    cancel: CancellationToken,
) {
    if let Some(stderr) = stderr {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("assistant stderr: {line}");
            }
        });
    }

    let Some(stdout) = stdout else {
        return;
    };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => return,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => route_line(&routes, &line),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("failed to read assistant output: {e}");
                    break;
                }
            }
        }

        // Unexpected exit: give every open session a way out of its turn.
        let orphaned: Vec<SessionEvents> = routes.lock().unwrap().drain().map(|(_, v)| v).collect();
        if !orphaned.is_empty() {
            tracing::warn!("assistant exited with {} open session(s)", orphaned.len());
        }
        for events in orphaned {
            events.emit(AssistantEvent::Error {
                message: "assistant process exited".to_string(),
            });
            events.emit(AssistantEvent::Idle);
        }
    });
}

fn route_line(routes: &Routes, line: &str) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    let envelope: Envelope = match serde_json::from_str(trimmed) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("ignoring unparseable assistant output ({e}): {trimmed}");
            return;
        }
    };
    let events = routes.lock().unwrap().get(&envelope.session_id).cloned();
    match events {
        Some(events) => events.emit(envelope.event),
        None => tracing::debug!(
            "dropping {} for unknown session {}",
            envelope.event.kind(),
            envelope.session_id
        ),
    }
}

struct ProcessClient {
    writer: Arc<Writer>,
    child: Mutex<Option<Child>>,
    routes: Routes,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl AssistantClient for ProcessClient {
    async fn create_session(
        &self,
        model: &str,
        events: SessionEvents,
    ) -> Result<Arc<dyn AssistantSession>, AssistantError> {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(
            "chat {}: assistant session {id} (generation {})",
            events.chat_id(),
            events.generation()
        );
        self.routes.lock().unwrap().insert(id.clone(), events);
        let request = json!({"type": "create_session", "session_id": id, "model": model});
        if let Err(e) = self.writer.write(AssistantErrorKind::Create, request).await {
            self.routes.lock().unwrap().remove(&id);
            return Err(e);
        }
        Ok(Arc::new(ProcessSession {
            id,
            writer: Arc::clone(&self.writer),
            routes: Arc::clone(&self.routes),
        }))
    }

    async fn stop(&self) -> Result<(), AssistantError> {
        self.cancel.cancel();
        self.writer.close().await;
        self.routes.lock().unwrap().clear();

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        // Closing stdin asks the assistant to exit; kill it if it lingers.
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!("assistant exited: {status}");
                Ok(())
            }
            Ok(Err(e)) => Err(AssistantError::new(AssistantErrorKind::Dispose, e.to_string())),
            Err(_) => child.kill().await.map_err(|e| {
                AssistantError::new(
                    AssistantErrorKind::Dispose,
                    format!("failed to kill assistant: {e}"),
                )
            }),
        }
    }
}

struct ProcessSession {
    id: String,
    writer: Arc<Writer>,
    routes: Routes,
}

#[async_trait::async_trait]
impl AssistantSession for ProcessSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, prompt: &str) -> Result<(), AssistantError> {
        let request = json!({"type": "send", "session_id": self.id, "prompt": prompt});
        self.writer.write(AssistantErrorKind::Send, request).await
    }

    async fn abort(&self) -> Result<(), AssistantError> {
        let request = json!({"type": "abort", "session_id": self.id});
        self.writer.write(AssistantErrorKind::Abort, request).await
    }

    async fn destroy(&self) -> Result<(), AssistantError> {
        self.routes.lock().unwrap().remove(&self.id);
        let request = json!({"type": "destroy", "session_id": self.id});
        self.writer.write(AssistantErrorKind::Dispose, request).await
    }
}
