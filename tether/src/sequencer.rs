//! Per-chat event sequencing.
//!
//! Assistant events arrive from reader tasks at arbitrary times. Each chat
//! gets a FIFO queue and at most one drain task; the drain awaits every
//! handler to completion before popping the next event, so the side effects
//! of two events for the same chat never overlap. Chats drain independently.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use crate::ChatId;
use crate::assistant::AssistantEvent;
use crate::orchestrator::HandlerError;

/// An event tagged with the generation of the session that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct SequencedEvent {
    pub generation: u64,
    pub event: AssistantEvent,
}

/// Consumer of sequenced events.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, chat_id: &ChatId, event: SequencedEvent) -> Result<(), HandlerError>;
}

#[derive(Default)]
struct ChatQueue {
    events: VecDeque<SequencedEvent>,
    draining: bool,
}

pub struct EventSequencer {
    handler: Weak<dyn EventHandler>,
    queues: StdMutex<HashMap<ChatId, ChatQueue>>,
}

impl EventSequencer {
    pub fn new(handler: Weak<dyn EventHandler>) -> Arc<Self> {
        Arc::new(Self {
            handler,
            queues: StdMutex::new(HashMap::new()),
        })
    }

    /// Emitter handed to an assistant session; events it emits are queued for
    /// `chat_id` under `generation`.
    pub fn events_for(self: &Arc<Self>, chat_id: ChatId, generation: u64) -> SessionEvents {
        SessionEvents {
            chat_id,
            generation,
            sequencer: Arc::downgrade(self),
        }
    }

    /// Append an event and start a drain for the chat unless one is running.
    pub fn enqueue(self: &Arc<Self>, chat_id: ChatId, event: SequencedEvent) {
        let start_drain = {
            let mut queues = self.queues.lock().unwrap();
            let queue = queues.entry(chat_id.clone()).or_default();
            queue.events.push_back(event);
            !std::mem::replace(&mut queue.draining, true)
        };
        if start_drain {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.drain(chat_id).await });
        }
    }

    async fn drain(&self, chat_id: ChatId) {
        loop {
            // Pop and clear the flag under one lock so an enqueue racing with
            // the end of the drain always starts a new one.
            let next = {
                let mut queues = self.queues.lock().unwrap();
                let Some(queue) = queues.get_mut(&chat_id) else {
                    return;
                };
                match queue.events.pop_front() {
                    Some(event) => event,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };

            let Some(handler) = self.handler.upgrade() else {
                tracing::debug!("event handler gone; dropping queue for chat {chat_id}");
                self.queues.lock().unwrap().remove(&chat_id);
                return;
            };
            let kind = next.event.kind();
            if let Err(e) = handler.handle(&chat_id, next).await {
                tracing::warn!("chat {chat_id}: {kind} handler failed: {e}");
            }
        }
    }

    /// Drop events not yet handled for a chat. A running drain finishes the
    /// event it is handling and then stops.
    pub fn clear(&self, chat_id: &ChatId) -> usize {
        let mut queues = self.queues.lock().unwrap();
        queues
            .get_mut(chat_id)
            .map(|queue| std::mem::take(&mut queue.events).len())
            .unwrap_or(0)
    }

    pub fn pending(&self, chat_id: &ChatId) -> usize {
        let queues = self.queues.lock().unwrap();
        queues.get(chat_id).map(|q| q.events.len()).unwrap_or(0)
    }

    /// True when nothing is queued or being handled for the chat.
    pub fn is_settled(&self, chat_id: &ChatId) -> bool {
        let queues = self.queues.lock().unwrap();
        queues
            .get(chat_id)
            .is_none_or(|q| q.events.is_empty() && !q.draining)
    }
}

/// Cheap, cloneable emitter bound to one chat and session generation.
#[derive(Clone)]
pub struct SessionEvents {
    chat_id: ChatId,
    generation: u64,
    sequencer: Weak<EventSequencer>,
}

impl SessionEvents {
    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: AssistantEvent) {
        match self.sequencer.upgrade() {
            Some(sequencer) => sequencer.enqueue(
                self.chat_id.clone(),
                SequencedEvent {
                    generation: self.generation,
                    event,
                },
            ),
            None => tracing::debug!(
                "sequencer gone; dropping {} for chat {}",
                event.kind(),
                self.chat_id
            ),
        }
    }
}
