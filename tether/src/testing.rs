//! Fakes and fixtures shared by the unit tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use chrono::Local;
use tempfile::TempDir;

use crate::assistant::{
    AssistantClient, AssistantError, AssistantErrorKind, AssistantEvent, AssistantLauncher,
    AssistantSession,
};
use crate::chat::{ChatTransport, SendOptions, TransportError};
use crate::config::OrchestratorConfig;
use crate::directory::DirectoryResolver;
use crate::orchestrator::{HandlerError, Orchestrator};
use crate::sequencer::{EventHandler, SequencedEvent, SessionEvents};
use crate::session::LiveSession;
use crate::{ChatId, MessageId};

/// Poll `condition` until it holds; panics after two seconds.
pub(crate) async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not met within 2s");
}

// ── Event handler ──

type DelayFn = Box<dyn Fn(&AssistantEvent) -> Duration + Send + Sync>;
type FailFn = Box<dyn Fn(&AssistantEvent) -> bool + Send + Sync>;

/// Records handled events and flags any overlap within a chat.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    events: StdMutex<Vec<(ChatId, SequencedEvent)>>,
    delay: StdMutex<Option<DelayFn>>,
    fail: StdMutex<Option<FailFn>>,
    active: StdMutex<HashSet<ChatId>>,
    overlap: AtomicBool,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn as_weak(self: &Arc<Self>) -> Weak<dyn EventHandler> {
        let weak: Weak<RecordingHandler> = Arc::downgrade(self);
        weak
    }

    pub fn set_delay(&self, delay: impl Fn(&AssistantEvent) -> Duration + Send + Sync + 'static) {
        *self.delay.lock().unwrap() = Some(Box::new(delay));
    }

    pub fn fail_on(&self, fail: impl Fn(&AssistantEvent) -> bool + Send + Sync + 'static) {
        *self.fail.lock().unwrap() = Some(Box::new(fail));
    }

    pub fn events(&self) -> Vec<(ChatId, SequencedEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn saw_overlap(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, chat_id: &ChatId, event: SequencedEvent) -> Result<(), HandlerError> {
        if !self.active.lock().unwrap().insert(chat_id.clone()) {
            self.overlap.store(true, Ordering::SeqCst);
        }
        let delay = self
            .delay
            .lock()
            .unwrap()
            .as_ref()
            .map_or(Duration::ZERO, |delay| delay(&event.event));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let fail = self
            .fail
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|fail| fail(&event.event));
        self.events.lock().unwrap().push((chat_id.clone(), event));
        self.active.lock().unwrap().remove(chat_id);
        if fail {
            return Err(TransportError("scripted failure".into()).into());
        }
        Ok(())
    }
}

// ── Assistant ──

#[derive(Default)]
struct FakeState {
    launches: Vec<PathBuf>,
    models: Vec<String>,
    events: Vec<SessionEvents>,
    sends: Vec<String>,
    aborts: usize,
    destroys: usize,
    stops: usize,
    /// Teardown-related calls in the order they happened.
    calls: Vec<&'static str>,
    fail_sends: bool,
    fail_creates: bool,
    hold_destroys: bool,
    hold_launches: bool,
    destroy_error: Option<AssistantError>,
}

/// Scripted assistant. Clones share state, so a test keeps one handle while
/// the orchestrator owns another.
#[derive(Clone, Default)]
pub(crate) struct FakeAssistant {
    state: Arc<StdMutex<FakeState>>,
}

impl FakeAssistant {
    pub fn launches(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().launches.clone()
    }

    /// Model of every session created so far.
    pub fn sessions(&self) -> Vec<String> {
        self.state.lock().unwrap().models.clone()
    }

    pub fn sends(&self) -> Vec<String> {
        self.state.lock().unwrap().sends.clone()
    }

    pub fn aborts(&self) -> usize {
        self.state.lock().unwrap().aborts
    }

    pub fn destroys(&self) -> usize {
        self.state.lock().unwrap().destroys
    }

    pub fn stops(&self) -> usize {
        self.state.lock().unwrap().stops
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().unwrap().fail_sends = fail;
    }

    pub fn fail_creates(&self, fail: bool) {
        self.state.lock().unwrap().fail_creates = fail;
    }

    /// Make `launch` hang until released.
    pub fn hold_launches(&self, hold: bool) {
        self.state.lock().unwrap().hold_launches = hold;
    }

    /// Make `destroy` hang until released.
    pub fn hold_destroys(&self, hold: bool) {
        self.state.lock().unwrap().hold_destroys = hold;
    }

    pub fn destroy_error(&self, error: Option<AssistantError>) {
        self.state.lock().unwrap().destroy_error = error;
    }

    /// Emitter of the most recently created session.
    pub fn latest_events(&self) -> SessionEvents {
        self.state
            .lock()
            .unwrap()
            .events
            .last()
            .cloned()
            .expect("no session created yet")
    }

    pub fn emit(&self, event: AssistantEvent) {
        self.latest_events().emit(event);
    }

    fn client(&self) -> Box<dyn AssistantClient> {
        Box::new(FakeClient {
            state: Arc::clone(&self.state),
        })
    }

    fn session(&self) -> Arc<dyn AssistantSession> {
        let id = format!("s{}", self.state.lock().unwrap().models.len());
        Arc::new(FakeSession {
            id,
            state: Arc::clone(&self.state),
        })
    }
}

#[async_trait::async_trait]
impl AssistantLauncher for FakeAssistant {
    async fn launch(&self, working_dir: &Path) -> Result<Box<dyn AssistantClient>, AssistantError> {
        while self.state.lock().unwrap().hold_launches {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        self.state
            .lock()
            .unwrap()
            .launches
            .push(working_dir.to_path_buf());
        Ok(self.client())
    }
}

struct FakeClient {
    state: Arc<StdMutex<FakeState>>,
}

#[async_trait::async_trait]
impl AssistantClient for FakeClient {
    async fn create_session(
        &self,
        model: &str,
        events: SessionEvents,
    ) -> Result<Arc<dyn AssistantSession>, AssistantError> {
        let fake = FakeAssistant {
            state: Arc::clone(&self.state),
        };
        {
            let mut state = self.state.lock().unwrap();
            if state.fail_creates {
                return Err(AssistantError::new(
                    AssistantErrorKind::Create,
                    "model unavailable",
                ));
            }
            state.models.push(model.to_string());
            state.events.push(events);
        }
        Ok(fake.session())
    }

    async fn stop(&self) -> Result<(), AssistantError> {
        let mut state = self.state.lock().unwrap();
        state.stops += 1;
        state.calls.push("stop");
        Ok(())
    }
}

struct FakeSession {
    id: String,
    state: Arc<StdMutex<FakeState>>,
}

#[async_trait::async_trait]
impl AssistantSession for FakeSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, prompt: &str) -> Result<(), AssistantError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sends {
            return Err(AssistantError::new(AssistantErrorKind::Send, "session busy"));
        }
        state.sends.push(prompt.to_string());
        Ok(())
    }

    async fn abort(&self) -> Result<(), AssistantError> {
        let mut state = self.state.lock().unwrap();
        state.aborts += 1;
        state.calls.push("abort");
        Ok(())
    }

    async fn destroy(&self) -> Result<(), AssistantError> {
        loop {
            let held = self.state.lock().unwrap().hold_destroys;
            if !held {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let mut state = self.state.lock().unwrap();
        state.destroys += 1;
        state.calls.push("destroy");
        match state.destroy_error.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// A live session rooted at `dir`, backed by a fresh fake.
pub(crate) fn live_session(dir: &str, generation: u64) -> (LiveSession, FakeAssistant) {
    let fake = FakeAssistant::default();
    let live = LiveSession {
        client: fake.client(),
        session: fake.session(),
        working_dir: PathBuf::from(dir),
        generation,
        marker: "🟢".to_string(),
        started_at: Local::now(),
    };
    (live, fake)
}

// ── Chat transport ──

#[derive(Clone, Debug)]
pub(crate) struct SentMessage {
    pub chat_id: ChatId,
    pub id: MessageId,
    pub text: String,
    pub options: SendOptions,
}

/// Records delivered messages; ids are `m1`, `m2`, ...
#[derive(Default)]
pub(crate) struct RecordingTransport {
    messages: StdMutex<Vec<SentMessage>>,
    reactions: StdMutex<Vec<(ChatId, MessageId, String)>>,
    next_id: AtomicU64,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn messages(&self, chat_id: &ChatId) -> Vec<SentMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| &m.chat_id == chat_id)
            .cloned()
            .collect()
    }

    pub fn texts(&self, chat_id: &ChatId) -> Vec<String> {
        self.messages(chat_id).into_iter().map(|m| m.text).collect()
    }

    pub fn reactions(&self, chat_id: &ChatId) -> Vec<(MessageId, String)> {
        self.reactions
            .lock()
            .unwrap()
            .iter()
            .filter(|(chat, _, _)| chat == chat_id)
            .map(|(_, id, reaction)| (id.clone(), reaction.clone()))
            .collect()
    }

    /// Make every call fail until reset.
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError("chat unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChatTransport for RecordingTransport {
    async fn send_message(
        &self,
        chat_id: &ChatId,
        text: &str,
        options: SendOptions,
    ) -> Result<MessageId, TransportError> {
        self.check()?;
        let id = MessageId::new(format!("m{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1));
        self.messages.lock().unwrap().push(SentMessage {
            chat_id: chat_id.clone(),
            id: id.clone(),
            text: text.to_string(),
            options,
        });
        Ok(id)
    }

    async fn set_reaction(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        reaction: &str,
    ) -> Result<(), TransportError> {
        self.check()?;
        self.reactions.lock().unwrap().push((
            chat_id.clone(),
            message_id.clone(),
            reaction.to_string(),
        ));
        Ok(())
    }
}

// ── Orchestrator fixture ──

struct StaticDirectories(Vec<PathBuf>);

impl DirectoryResolver for StaticDirectories {
    fn list_directories(&self) -> Vec<PathBuf> {
        self.0.clone()
    }
}

/// An orchestrator wired to fakes, with `alpha` and `beta` as the offered
/// directories and markers `🟢`, `🔵`.
pub(crate) struct Harness {
    pub orchestrator: Orchestrator,
    pub assistant: FakeAssistant,
    pub transport: Arc<RecordingTransport>,
    root: PathBuf,
    _tmp: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let dirs: Vec<PathBuf> = ["alpha", "beta"].iter().map(|d| root.join(d)).collect();
        for dir in &dirs {
            std::fs::create_dir(dir).unwrap();
        }

        let config = OrchestratorConfig {
            default_model: "m".to_string(),
            markers: vec!["🟢".to_string(), "🔵".to_string()],
            teardown_timeout: Duration::from_millis(200),
            shutdown_grace: Duration::from_millis(500),
        };
        let assistant = FakeAssistant::default();
        let transport = Arc::new(RecordingTransport::default());
        let orchestrator = Orchestrator::new(
            config,
            transport.clone(),
            Arc::new(assistant.clone()),
            Arc::new(StaticDirectories(dirs)),
        );
        Self {
            orchestrator,
            assistant,
            transport,
            root,
            _tmp: tmp,
        }
    }

    pub fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Chat `name` with an idle session in `alpha`.
    pub async fn started(&self, name: &str) -> ChatId {
        let chat = ChatId::from(name);
        self.orchestrator
            .start_session(&chat, &self.dir("alpha"), None)
            .await
            .unwrap();
        chat
    }

    /// Wait until every event emitted for the chat has been handled.
    pub async fn settle(&self, chat_id: &ChatId) {
        let sequencer = self.orchestrator.sequencer();
        wait_for(|| sequencer.is_settled(chat_id)).await;
    }
}
