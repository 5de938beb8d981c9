//! Conversation list reconciliation.
//!
//! Two inputs feed one list: authoritative snapshots from a full fetch, and
//! best-effort fan-out events that may arrive late, twice, or never. The
//! list is kept ordered by `last_message_at` descending (conversation id
//! ascending on ties) after every mutation.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use dealroom_types::events::{FanoutEvent, NewConversationPayload, NewMessagePayload};
use dealroom_types::models::{Conversation, Message, ProjectionViolation, Role};

use crate::notify::Notifier;

/// Who is looking at the inbox. Passed in explicitly; used to suppress
/// alerts for the viewer's own messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: Uuid,
    pub role: Role,
}

/// One row of the list.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationEntry {
    pub conversation: Conversation,
    /// Loaded thread, oldest first. `None` until fetched.
    pub thread: Option<Vec<Message>>,
    /// Messages from other users applied since the last `mark_read`.
    pub unread: u32,
}

/// A conversation as delivered by a full fetch, optionally with its thread.
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub conversation: Conversation,
    pub messages: Option<Vec<Message>>,
}

impl From<Conversation> for ConversationSnapshot {
    fn from(conversation: Conversation) -> Self {
        Self {
            conversation,
            messages: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The conversation is not in the list; the event was discarded.
    Dropped,
    /// The message was already applied.
    Duplicate,
    /// Applied; the conversation now sits at `position`.
    Applied { position: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("entry {index} sorts after its successor")]
    OutOfOrder { index: usize },
    #[error("conversation {0} appears more than once")]
    DuplicateConversation(Uuid),
    #[error("thread of {0} is not sorted by created_at")]
    ThreadOutOfOrder(Uuid),
    #[error("conversation {conversation_id}: {violation}")]
    Projection {
        conversation_id: Uuid,
        violation: ProjectionViolation,
    },
}

/// Event-applied message ids kept for replay detection.
const RECENT_MESSAGE_CAPACITY: usize = 1024;

/// Bounded set of message ids, oldest evicted first.
#[derive(Default)]
struct RecentIds {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl RecentIds {
    fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: Uuid) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > RECENT_MESSAGE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

pub struct Reconciler {
    viewer: Viewer,
    entries: Vec<ConversationEntry>,
    /// Newest `created_at` already counted by a fetch, per conversation. The
    /// store hands out strictly increasing times within a conversation, so
    /// any event at or below this is already in the projection.
    watermarks: HashMap<Uuid, DateTime<Utc>>,
    /// Ids applied from events since the last snapshot.
    recent: RecentIds,
    notifier: Box<dyn Notifier>,
}

impl Reconciler {
    pub fn new(viewer: Viewer, notifier: Box<dyn Notifier>) -> Self {
        Self {
            viewer,
            entries: Vec::new(),
            watermarks: HashMap::new(),
            recent: RecentIds::default(),
            notifier,
        }
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.entries.iter().map(|e| &e.conversation)
    }

    pub fn get(&self, conversation_id: Uuid) -> Option<&ConversationEntry> {
        self.entries.iter().find(|e| e.conversation.id == conversation_id)
    }

    pub fn position(&self, conversation_id: Uuid) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.conversation.id == conversation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_unread(&self) -> u32 {
        self.entries.iter().map(|e| e.unread).sum()
    }

    /// Replace the list wholesale with an authoritative fetch.
    ///
    /// The fetch order is kept except where it disagrees with the list
    /// order (stable sort). Entries that carry a thread get their cached
    /// projection rebuilt from it. Unread counters start at zero.
    pub fn load_snapshot(&mut self, snapshot: Vec<ConversationSnapshot>) {
        let mut ids = HashSet::with_capacity(snapshot.len());
        let mut entries = Vec::with_capacity(snapshot.len());
        self.watermarks.clear();
        self.recent.clear();

        for item in snapshot {
            let ConversationSnapshot {
                mut conversation,
                messages,
            } = item;

            if !ids.insert(conversation.id) {
                warn!("Snapshot lists conversation {} twice, keeping the first", conversation.id);
                continue;
            }

            let thread = messages.map(|mut messages| {
                messages.sort_by(Message::thread_order);
                messages.dedup_by_key(|m| m.id);
                conversation.recompute_projection(&messages);
                messages
            });

            if conversation.last_message.is_some() {
                self.watermarks.insert(conversation.id, conversation.last_message_at);
            }

            entries.push(ConversationEntry {
                conversation,
                thread,
                unread: 0,
            });
        }

        entries.sort_by(|a, b| Conversation::recency_order(&a.conversation, &b.conversation));
        debug!("Loaded snapshot with {} conversations", entries.len());
        self.entries = entries;
    }

    /// Route a fan-out event to the matching apply operation.
    pub fn apply(&mut self, event: FanoutEvent) {
        match event {
            FanoutEvent::NewMessage(payload) => {
                self.apply_message_event(payload);
            }
            FanoutEvent::NewConversation(payload) => {
                self.apply_conversation_created_event(payload);
            }
        }
    }

    /// Fold a `new-message` event into the list.
    ///
    /// Unknown conversations are dropped; the next snapshot closes the gap.
    /// A message that advances `last_message_at` moves its conversation to
    /// the front (to its ordered slot, which is the front unless clocks
    /// disagree). A stale message only patches the thread and the count.
    pub fn apply_message_event(&mut self, payload: NewMessagePayload) -> ApplyOutcome {
        let NewMessagePayload {
            conversation_id,
            message,
        } = payload;

        let Some(index) = self.position(conversation_id) else {
            trace!("Dropping message {} for unknown conversation {}", message.id, conversation_id);
            return ApplyOutcome::Dropped;
        };

        if message.conversation_id != conversation_id {
            warn!(
                "Message {} claims conversation {} but was addressed to {}",
                message.id, message.conversation_id, conversation_id
            );
            return ApplyOutcome::Dropped;
        }

        let counted_by_fetch = self
            .watermarks
            .get(&conversation_id)
            .is_some_and(|mark| message.created_at <= *mark);
        if counted_by_fetch || self.recent.contains(&message.id) {
            return ApplyOutcome::Duplicate;
        }
        self.recent.insert(message.id);

        let from_viewer = message.sender_id == self.viewer.user_id;
        let entry = &mut self.entries[index];
        let advanced = entry.conversation.record_message(&message);

        if let Some(thread) = entry.thread.as_mut() {
            let at = thread.partition_point(|m| Message::thread_order(m, &message) == Ordering::Less);
            thread.insert(at, message.clone());
        }
        if !from_viewer {
            entry.unread += 1;
        }

        let position = if advanced { self.reposition(index) } else { index };

        if !from_viewer {
            self.notifier.notify(&self.entries[position].conversation, &message);
        }

        ApplyOutcome::Applied { position }
    }

    /// Insert a conversation announced by `new-conversation` at its ordered
    /// slot, which is the front for a conversation created just now. Replays
    /// of a conversation already in the list are ignored. Returns whether it
    /// was inserted.
    pub fn apply_conversation_created_event(&mut self, payload: NewConversationPayload) -> bool {
        let conversation = payload.conversation;
        if self.position(conversation.id).is_some() {
            trace!("Conversation {} already listed", conversation.id);
            return false;
        }

        let at = self.slot_for(&conversation);
        debug!("Inserted conversation {} at {}", conversation.id, at);
        self.entries.insert(
            at,
            ConversationEntry {
                conversation,
                thread: None,
                unread: 0,
            },
        );
        true
    }

    /// Materialize a conversation's thread from a separate fetch. The
    /// projection is rebuilt from it. Returns false for unknown conversations.
    pub fn attach_thread(&mut self, conversation_id: Uuid, mut messages: Vec<Message>) -> bool {
        let Some(index) = self.position(conversation_id) else {
            return false;
        };

        messages.sort_by(Message::thread_order);
        messages.dedup_by_key(|m| m.id);

        let entry = &mut self.entries[index];
        let before = entry.conversation.last_message_at;
        entry.conversation.recompute_projection(&messages);
        entry.thread = Some(messages);

        if entry.conversation.last_message.is_some() {
            let mark = self.watermarks.entry(conversation_id).or_insert(entry.conversation.last_message_at);
            *mark = (*mark).max(entry.conversation.last_message_at);
        }

        if entry.conversation.last_message_at != before {
            self.reposition(index);
        }
        true
    }

    /// Clear the unread counter. Returns false for unknown conversations.
    pub fn mark_read(&mut self, conversation_id: Uuid) -> bool {
        match self.entries.iter_mut().find(|e| e.conversation.id == conversation_id) {
            Some(entry) => {
                entry.unread = 0;
                true
            }
            None => false,
        }
    }

    /// Every ordering, uniqueness, and projection problem in the list.
    /// Projections are only checked for entries with a loaded thread.
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        let mut ids = HashSet::new();

        for (index, pair) in self.entries.windows(2).enumerate() {
            if Conversation::recency_order(&pair[0].conversation, &pair[1].conversation) == Ordering::Greater {
                violations.push(InvariantViolation::OutOfOrder { index });
            }
        }

        for entry in &self.entries {
            let id = entry.conversation.id;
            if !ids.insert(id) {
                violations.push(InvariantViolation::DuplicateConversation(id));
            }

            let Some(thread) = &entry.thread else { continue };
            if thread
                .windows(2)
                .any(|w| Message::thread_order(&w[0], &w[1]) == Ordering::Greater)
            {
                violations.push(InvariantViolation::ThreadOutOfOrder(id));
            }
            violations.extend(
                entry
                    .conversation
                    .projection_violations(thread)
                    .into_iter()
                    .map(|violation| InvariantViolation::Projection {
                        conversation_id: id,
                        violation,
                    }),
            );
        }

        violations
    }

    /// First index where `conversation` fits the list order.
    fn slot_for(&self, conversation: &Conversation) -> usize {
        self.entries.partition_point(|e| {
            Conversation::recency_order(&e.conversation, conversation) == Ordering::Less
        })
    }

    /// Move the entry at `index` to its ordered slot. Returns the new index.
    fn reposition(&mut self, index: usize) -> usize {
        let entry = self.entries.remove(index);
        let at = self.slot_for(&entry.conversation);
        self.entries.insert(at, entry);
        at
    }
}
