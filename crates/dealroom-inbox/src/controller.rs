//! Per-conversation interaction state for a thread list UI.
//!
//! Every piece of state is keyed by conversation id, so expanding, typing,
//! or sending in one conversation never touches another.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};
use uuid::Uuid;

use dealroom_types::models::Message;

use crate::store::{MessageSink, StoreError};

/// Side effects for the view layer to carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEffect {
    ScrollToLatest(Uuid),
    ShowError { conversation_id: Uuid, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("nothing to send")]
    EmptyDraft,
    #[error("a message is already being sent in this conversation")]
    AlreadySending,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A send that has passed the guards and is waiting on the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub conversation_id: Uuid,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Enter,
    Char(char),
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPress {
    pub key: Key,
    pub shift: bool,
}

impl KeyPress {
    pub fn enter() -> Self {
        Self { key: Key::Enter, shift: false }
    }

    pub fn shift_enter() -> Self {
        Self { key: Key::Enter, shift: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    /// Enter: the caller should start a send.
    Submit,
    /// Shift+Enter: a newline was appended to the draft.
    InsertNewline,
    Ignored,
}

#[derive(Debug, Default)]
pub struct ThreadController {
    expanded: HashSet<Uuid>,
    drafts: HashMap<Uuid, String>,
    sending: HashSet<Uuid>,
    effects: Vec<UiEffect>,
}

impl ThreadController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip one conversation between expanded and collapsed. Returns whether
    /// it is now expanded. Expanding asks the view to scroll to the newest
    /// message.
    pub fn toggle(&mut self, conversation_id: Uuid) -> bool {
        if self.expanded.remove(&conversation_id) {
            return false;
        }
        self.expanded.insert(conversation_id);
        self.effects.push(UiEffect::ScrollToLatest(conversation_id));
        true
    }

    pub fn is_expanded(&self, conversation_id: Uuid) -> bool {
        self.expanded.contains(&conversation_id)
    }

    pub fn is_sending(&self, conversation_id: Uuid) -> bool {
        self.sending.contains(&conversation_id)
    }

    pub fn set_draft(&mut self, conversation_id: Uuid, text: impl Into<String>) {
        self.drafts.insert(conversation_id, text.into());
    }

    pub fn draft(&self, conversation_id: Uuid) -> &str {
        self.drafts.get(&conversation_id).map(String::as_str).unwrap_or("")
    }

    pub fn handle_key(&mut self, conversation_id: Uuid, press: KeyPress) -> KeyAction {
        match press.key {
            Key::Enter if press.shift => {
                self.drafts.entry(conversation_id).or_default().push('\n');
                KeyAction::InsertNewline
            }
            Key::Enter => KeyAction::Submit,
            _ => KeyAction::Ignored,
        }
    }

    /// Guard a send: the draft must have content and no other send may be in
    /// flight for this conversation. On success the conversation is marked
    /// as sending until `finish_send`.
    pub fn begin_send(&mut self, conversation_id: Uuid) -> Result<PendingSend, SendError> {
        if self.sending.contains(&conversation_id) {
            return Err(SendError::AlreadySending);
        }

        let content = self.draft(conversation_id).trim().to_string();
        if content.is_empty() {
            return Err(SendError::EmptyDraft);
        }

        self.sending.insert(conversation_id);
        Ok(PendingSend { conversation_id, content })
    }

    /// Settle a send started with `begin_send`. The message itself is not
    /// inserted anywhere: it shows up through the fan-out event.
    pub fn finish_send(&mut self, pending: PendingSend, result: Result<Message, StoreError>) -> Result<Message, SendError> {
        let conversation_id = pending.conversation_id;
        self.sending.remove(&conversation_id);

        match result {
            Ok(message) => {
                self.drafts.remove(&conversation_id);
                self.effects.push(UiEffect::ScrollToLatest(conversation_id));
                debug!("Sent message {} to {}", message.id, conversation_id);
                Ok(message)
            }
            Err(e) => {
                warn!("Send to {} failed: {}", conversation_id, e);
                self.effects.push(UiEffect::ShowError {
                    conversation_id,
                    message: e.to_string(),
                });
                Err(SendError::Store(e))
            }
        }
    }

    /// `begin_send`, append through `sink`, then `finish_send`.
    pub async fn send<S: MessageSink>(&mut self, conversation_id: Uuid, sink: &S) -> Result<Message, SendError> {
        let pending = self.begin_send(conversation_id)?;
        let result = sink.append_message(conversation_id, &pending.content).await;
        self.finish_send(pending, result)
    }

    /// Take the queued effects, oldest first.
    pub fn drain_effects(&mut self) -> Vec<UiEffect> {
        std::mem::take(&mut self.effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;

    use chrono::Utc;
    use dealroom_types::models::Role;
    use parking_lot::Mutex;

    struct FakeSink {
        fail: bool,
        sent: Mutex<Vec<(Uuid, String)>>,
    }

    impl FakeSink {
        fn new(fail: bool) -> Self {
            Self { fail, sent: Mutex::new(Vec::new()) }
        }
    }

    impl MessageSink for FakeSink {
        fn append_message(
            &self,
            conversation_id: Uuid,
            content: &str,
        ) -> impl Future<Output = Result<Message, StoreError>> + Send {
            self.sent.lock().push((conversation_id, content.to_string()));
            let result = if self.fail {
                Err(StoreError::Network("connection reset".into()))
            } else {
                Ok(Message {
                    id: Uuid::new_v4(),
                    conversation_id,
                    sender_id: Uuid::new_v4(),
                    sender_name: "Ada".into(),
                    sender_role: Role::Investor,
                    content: content.to_string(),
                    kind: "text".into(),
                    created_at: Utc::now(),
                    read_by: vec![],
                })
            };
            async move { result }
        }
    }

    #[test]
    fn toggle_is_per_conversation() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut c = ThreadController::new();

        assert!(c.toggle(a));
        assert!(c.is_expanded(a));
        assert!(!c.is_expanded(b));
        assert_eq!(c.drain_effects(), vec![UiEffect::ScrollToLatest(a)]);

        assert!(c.toggle(b));
        assert!(!c.toggle(a));
        assert!(!c.is_expanded(a));
        assert!(c.is_expanded(b));
        assert_eq!(c.drain_effects(), vec![UiEffect::ScrollToLatest(b)]);
    }

    #[test]
    fn drafts_are_independent() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut c = ThreadController::new();

        c.set_draft(a, "for a");
        c.set_draft(b, "for b");
        assert_eq!(c.draft(a), "for a");
        assert_eq!(c.draft(b), "for b");
        assert_eq!(c.draft(Uuid::new_v4()), "");
    }

    #[test]
    fn enter_submits_and_shift_enter_adds_newline() {
        let a = Uuid::new_v4();
        let mut c = ThreadController::new();
        c.set_draft(a, "line one");

        assert_eq!(c.handle_key(a, KeyPress::shift_enter()), KeyAction::InsertNewline);
        assert_eq!(c.draft(a), "line one\n");
        assert_eq!(c.handle_key(a, KeyPress::enter()), KeyAction::Submit);
        assert_eq!(c.draft(a), "line one\n");
        assert_eq!(c.handle_key(a, KeyPress { key: Key::Char('x'), shift: false }), KeyAction::Ignored);
    }

    #[test]
    fn whitespace_drafts_are_not_sent() {
        let a = Uuid::new_v4();
        let mut c = ThreadController::new();
        c.set_draft(a, "  \n\t ");

        assert_eq!(c.begin_send(a), Err(SendError::EmptyDraft));
        assert!(!c.is_sending(a));
        assert_eq!(c.begin_send(Uuid::new_v4()), Err(SendError::EmptyDraft));
    }

    #[test]
    fn second_send_is_rejected_only_for_the_same_conversation() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut c = ThreadController::new();
        c.set_draft(a, "first");
        c.set_draft(b, "other");

        let pending = c.begin_send(a).unwrap();
        assert_eq!(pending.content, "first");
        assert_eq!(c.begin_send(a), Err(SendError::AlreadySending));
        assert!(c.begin_send(b).is_ok());
        assert!(c.is_sending(a) && c.is_sending(b));
    }

    #[tokio::test]
    async fn successful_send_clears_draft_and_scrolls() {
        let a = Uuid::new_v4();
        let sink = FakeSink::new(false);
        let mut c = ThreadController::new();
        c.set_draft(a, "  Hello  ");

        let message = c.send(a, &sink).await.unwrap();
        assert_eq!(message.content, "Hello");
        assert_eq!(*sink.sent.lock(), vec![(a, "Hello".to_string())]);
        assert_eq!(c.draft(a), "");
        assert!(!c.is_sending(a));
        assert_eq!(c.drain_effects(), vec![UiEffect::ScrollToLatest(a)]);
    }

    #[tokio::test]
    async fn failed_send_keeps_draft_and_shows_error() {
        let a = Uuid::new_v4();
        let sink = FakeSink::new(true);
        let mut c = ThreadController::new();
        c.set_draft(a, "keep me");

        let err = c.send(a, &sink).await.unwrap_err();
        assert!(matches!(err, SendError::Store(StoreError::Network(_))));
        assert_eq!(c.draft(a), "keep me");
        assert!(!c.is_sending(a));

        let effects = c.drain_effects();
        assert_eq!(effects.len(), 1);
        assert!(matches!(&effects[0], UiEffect::ShowError { conversation_id, .. } if *conversation_id == a));

        // no automatic retry
        assert_eq!(sink.sent.lock().len(), 1);
    }
}
