use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Local;
use rand::seq::IndexedRandom;
use tokio::sync::Mutex;

use super::{Inner, Orchestrator};
use crate::ChatId;
use crate::assistant::AssistantError;
use crate::session::{ChatSession, LiveSession, Phase, Rejection};

/// Marker used when the configured pool is empty.
const FALLBACK_MARKER: &str = "•";

/// A session that is ready for prompts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStarted {
    pub working_dir: PathBuf,
    pub model: String,
    pub marker: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error("cannot switch to directory {}: {reason}", .path.display())]
    CannotSwitchDirectory { path: PathBuf, reason: String },
    #[error("failed to start assistant session: {0}")]
    Create(#[source] AssistantError),
    #[error("shutting down, no new sessions are started")]
    ShuttingDown,
}

impl Orchestrator {
    /// Start a session for the chat in `working_dir`, replacing any existing
    /// one. `model` defaults to the chat's current model.
    ///
    /// On failure the chat is left without a session; the previous session
    /// is not restored.
    pub async fn start_session(
        &self,
        chat_id: &ChatId,
        working_dir: &Path,
        model: Option<&str>,
    ) -> Result<SessionStarted, LifecycleError> {
        let chat = self.inner.chat(chat_id).await;
        let (old, model) = {
            let mut chat = chat.lock().await;
            let old = chat.begin_switch()?;
            let model = model.map_or_else(|| chat.model().to_string(), str::to_string);
            (old, model)
        };
        self.inner
            .restart(chat_id, &chat, old, working_dir.to_path_buf(), model)
            .await
    }

    /// Start a session in the `index`-th (1-based) listed directory.
    pub async fn select_directory(
        &self,
        chat_id: &ChatId,
        index: usize,
    ) -> Result<SessionStarted, LifecycleError> {
        let dirs = self.list_directories(chat_id).await;
        let Some(dir) = index.checked_sub(1).and_then(|i| dirs.get(i)) else {
            return Err(Rejection::InvalidSelection {
                index,
                available: dirs.len(),
            }
            .into());
        };
        self.start_session(chat_id, dir, None).await
    }

    /// Replace the chat's session with a fresh one in the same directory
    /// with the same model. Queued prompts are dropped and the turn count
    /// restarts at zero.
    pub async fn reset_session(&self, chat_id: &ChatId) -> Result<SessionStarted, LifecycleError> {
        let chat = self.inner.chat(chat_id).await;
        let (old, model) = {
            let mut chat = chat.lock().await;
            let old = chat.begin_reset()?;
            (old, chat.model().to_string())
        };
        tracing::info!(
            "chat {chat_id}: resetting session in {}",
            old.working_dir.display()
        );
        if let Err(e) = old.session.abort().await {
            log_teardown_error(chat_id, "abort", &e);
        }
        let working_dir = old.working_dir.clone();
        self.inner
            .restart(chat_id, &chat, Some(old), working_dir, model)
            .await
    }

    /// Record a new model for the chat. A live session is restarted in its
    /// directory so the model takes effect; returns the new session then.
    pub async fn set_model(
        &self,
        chat_id: &ChatId,
        model: &str,
    ) -> Result<Option<SessionStarted>, LifecycleError> {
        let chat = self.inner.chat(chat_id).await;
        let working_dir = {
            let mut chat = chat.lock().await;
            if *chat.phase() == Phase::Resetting {
                return Err(Rejection::ResetInProgress.into());
            }
            chat.set_model(model);
            chat.working_dir().map(Path::to_path_buf)
        };
        match working_dir {
            Some(dir) => self.start_session(chat_id, &dir, Some(model)).await.map(Some),
            None => Ok(None),
        }
    }

    /// Tear down every live session. Each teardown step is bounded by the
    /// teardown timeout and the whole pass by the shutdown grace period;
    /// whatever is still running after that is abandoned.
    ///
    /// Restarts already in flight discard the session they create, and
    /// shutdown waits for them within the same grace period.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let chats: Vec<(ChatId, Arc<Mutex<ChatSession>>)> = self
            .inner
            .chats
            .lock()
            .await
            .iter()
            .map(|(id, chat)| (id.clone(), Arc::clone(chat)))
            .collect();

        let mut teardowns = tokio::task::JoinSet::new();
        for (chat_id, chat) in &chats {
            let live = {
                let mut chat = chat.lock().await;
                // a running restart owns this chat and cleans up after itself
                if *chat.phase() == Phase::Resetting {
                    continue;
                }
                chat.clear_session()
            };
            let Some(live) = live else {
                continue;
            };
            self.inner.sequencer.clear(chat_id);
            self.inner.release_marker(chat_id);
            let inner = Arc::clone(&self.inner);
            let chat_id = chat_id.clone();
            teardowns.spawn(async move { inner.teardown(&chat_id, live).await });
        }

        let grace = self.inner.config.shutdown_grace;
        tracing::info!("shutting down {} session(s)", teardowns.len());
        let finished = tokio::time::timeout(grace, async {
            while teardowns.join_next().await.is_some() {}
            self.inner.wait_for_restarts(&chats).await;
        })
        .await;
        if finished.is_err() {
            tracing::warn!(
                "shutdown grace of {grace:?} elapsed, abandoning {} teardown(s)",
                teardowns.len()
            );
            teardowns.abort_all();
        }
    }
}

impl Inner {
    /// Tear down `old`, then create and install a session. The chat must be
    /// in `Resetting`; it leaves in `Idle` on success and `NoSession` on
    /// failure.
    async fn restart(
        &self,
        chat_id: &ChatId,
        chat: &Mutex<ChatSession>,
        old: Option<LiveSession>,
        working_dir: PathBuf,
        model: String,
    ) -> Result<SessionStarted, LifecycleError> {
        let result = self
            .replace_session(chat_id, chat, old, working_dir, model)
            .await;
        self.restarts_settled.notify_waiters();
        result
    }

    async fn replace_session(
        &self,
        chat_id: &ChatId,
        chat: &Mutex<ChatSession>,
        old: Option<LiveSession>,
        working_dir: PathBuf,
        model: String,
    ) -> Result<SessionStarted, LifecycleError> {
        if let Some(old) = old {
            self.release_marker(chat_id);
            self.teardown(chat_id, old).await;
        }
        let dropped = self.sequencer.clear(chat_id);
        if dropped > 0 {
            tracing::debug!("chat {chat_id}: dropped {dropped} pending event(s) from old session");
        }

        if self.is_shutting_down() {
            chat.lock().await.clear_session();
            return Err(LifecycleError::ShuttingDown);
        }

        match self.create(chat_id, chat, &working_dir, &model).await {
            Ok(live) => {
                let started = SessionStarted {
                    working_dir: live.working_dir.clone(),
                    model: model.clone(),
                    marker: live.marker.clone(),
                };
                let mut guard = chat.lock().await;
                // Checked under the chat lock: shutdown either sees this
                // session installed or we see its flag.
                if self.is_shutting_down() {
                    guard.clear_session();
                    drop(guard);
                    tracing::info!("chat {chat_id}: shutting down, discarding new session");
                    self.release_marker(chat_id);
                    self.teardown(chat_id, live).await;
                    return Err(LifecycleError::ShuttingDown);
                }
                guard.install_session(live, model);
                drop(guard);
                tracing::info!(
                    "chat {chat_id}: session ready in {} with {}",
                    started.working_dir.display(),
                    started.model
                );
                Ok(started)
            }
            Err(e) => {
                chat.lock().await.clear_session();
                tracing::warn!("chat {chat_id}: session start failed: {e}");
                Err(e)
            }
        }
    }

    async fn create(
        &self,
        chat_id: &ChatId,
        chat: &Mutex<ChatSession>,
        working_dir: &Path,
        model: &str,
    ) -> Result<LiveSession, LifecycleError> {
        switch_directory(working_dir).await?;

        let generation = chat.lock().await.next_generation();
        let client = self
            .launcher
            .launch(working_dir)
            .await
            .map_err(LifecycleError::Create)?;
        let events = self.sequencer.events_for(chat_id.clone(), generation);
        let session = match client.create_session(model, events).await {
            Ok(session) => session,
            Err(e) => {
                match tokio::time::timeout(self.config.teardown_timeout, client.stop()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(stop_err)) => log_teardown_error(chat_id, "client stop", &stop_err),
                    Err(_) => tracing::warn!("chat {chat_id}: client stop timed out"),
                }
                return Err(LifecycleError::Create(e));
            }
        };

        Ok(LiveSession {
            client,
            session,
            working_dir: working_dir.to_path_buf(),
            generation,
            marker: self.claim_marker(chat_id),
            started_at: Local::now(),
        })
    }

    /// Destroy the session, then stop its client. Both steps are bounded by
    /// the teardown timeout and never fail the caller.
    async fn teardown(&self, chat_id: &ChatId, live: LiveSession) {
        let limit = self.config.teardown_timeout;
        match tokio::time::timeout(limit, live.session.destroy()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log_teardown_error(chat_id, "session destroy", &e),
            Err(_) => tracing::warn!("chat {chat_id}: session destroy timed out after {limit:?}"),
        }
        match tokio::time::timeout(limit, live.client.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log_teardown_error(chat_id, "client stop", &e),
            Err(_) => tracing::warn!("chat {chat_id}: client stop timed out after {limit:?}"),
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Wait until none of `chats` is in the middle of a restart.
    async fn wait_for_restarts(&self, chats: &[(ChatId, Arc<Mutex<ChatSession>>)]) {
        loop {
            // registered before checking, so a restart finishing in between
            // still wakes us
            let settled = self.restarts_settled.notified();
            let mut restarting = 0;
            for (_, chat) in chats {
                if *chat.lock().await.phase() == Phase::Resetting {
                    restarting += 1;
                }
            }
            if restarting == 0 {
                return;
            }
            tracing::debug!("waiting for {restarting} session restart(s) to finish");
            settled.await;
        }
    }

    fn claim_marker(&self, chat_id: &ChatId) -> String {
        let mut markers = self.markers.lock().unwrap();
        let marker = {
            let in_use: HashSet<&str> = markers
                .iter()
                .filter(|(id, _)| *id != chat_id)
                .map(|(_, marker)| marker.as_str())
                .collect();
            pick_marker(&self.config.markers, &in_use)
        };
        markers.insert(chat_id.clone(), marker.clone());
        marker
    }

    fn release_marker(&self, chat_id: &ChatId) {
        self.markers.lock().unwrap().remove(chat_id);
    }
}

/// The working directory is handed to the launcher rather than applied to
/// the process, so switching only has to validate it.
async fn switch_directory(path: &Path) -> Result<(), LifecycleError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(LifecycleError::CannotSwitchDirectory {
            path: path.to_path_buf(),
            reason: "not a directory".to_string(),
        }),
        Err(e) => Err(LifecycleError::CannotSwitchDirectory {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// First marker not held by another live session; once the pool is
/// exhausted, a random one is reused.
fn pick_marker(pool: &[String], in_use: &HashSet<&str>) -> String {
    if let Some(free) = pool.iter().find(|m| !in_use.contains(m.as_str())) {
        return free.clone();
    }
    pool.choose(&mut rand::rng())
        .cloned()
        .unwrap_or_else(|| FALLBACK_MARKER.to_string())
}

/// Disposal races are expected during teardown and only logged at debug.
fn teardown_log_level(e: &AssistantError) -> tracing::Level {
    if e.is_disposal_race() {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    }
}

fn log_teardown_error(chat_id: &ChatId, step: &str, e: &AssistantError) {
    if teardown_log_level(e) == tracing::Level::DEBUG {
        tracing::debug!("chat {chat_id}: {step} raced with transport disposal: {e}");
    } else {
        tracing::warn!("chat {chat_id}: {step} failed: {e}");
    }
}
