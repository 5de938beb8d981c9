//! Single-task owner of the conversation list.
//!
//! Snapshots, gateway deliveries and UI requests all arrive on one bounded
//! queue and are applied in arrival order by one task, so the reconciler
//! never needs a lock.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use dealroom_types::events::FanoutEvent;
use dealroom_types::models::Message;

use crate::reconciler::{ConversationEntry, ConversationSnapshot, Reconciler};
use crate::store::{HttpStore, Scope, StoreError};

const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("inbox session has shut down")]
pub struct SessionClosed;

#[derive(Debug)]
enum InboxCommand {
    LoadSnapshot(Vec<ConversationSnapshot>),
    Deliver(FanoutEvent),
    AttachThread {
        conversation_id: Uuid,
        messages: Vec<Message>,
    },
    MarkRead(Uuid),
    Entries(oneshot::Sender<Vec<ConversationEntry>>),
    Entry(Uuid, oneshot::Sender<Option<ConversationEntry>>),
    TotalUnread(oneshot::Sender<u32>),
    Shutdown,
}

#[derive(Clone)]
pub struct InboxHandle {
    tx: mpsc::Sender<InboxCommand>,
}

/// Start the session task. It runs until `shutdown` is called or every
/// handle is dropped, then hands the reconciler back.
pub fn spawn_inbox(reconciler: Reconciler) -> (InboxHandle, JoinHandle<Reconciler>) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let task = tokio::spawn(run(reconciler, rx));
    (InboxHandle { tx }, task)
}

async fn run(mut reconciler: Reconciler, mut rx: mpsc::Receiver<InboxCommand>) -> Reconciler {
    info!("Inbox session started for {}", reconciler.viewer().user_id);

    while let Some(command) = rx.recv().await {
        match command {
            InboxCommand::LoadSnapshot(snapshot) => reconciler.load_snapshot(snapshot),
            InboxCommand::Deliver(event) => {
                debug!("Applying {}", event.name());
                reconciler.apply(event);
            }
            InboxCommand::AttachThread {
                conversation_id,
                messages,
            } => {
                reconciler.attach_thread(conversation_id, messages);
            }
            InboxCommand::MarkRead(id) => {
                reconciler.mark_read(id);
            }
            // A dropped receiver only means the asker stopped waiting
            InboxCommand::Entries(reply) => {
                let _ = reply.send(reconciler.entries().to_vec());
            }
            InboxCommand::Entry(id, reply) => {
                let _ = reply.send(reconciler.get(id).cloned());
            }
            InboxCommand::TotalUnread(reply) => {
                let _ = reply.send(reconciler.total_unread());
            }
            InboxCommand::Shutdown => break,
        }
    }

    info!("Inbox session stopped");
    reconciler
}

impl InboxHandle {
    async fn send(&self, command: InboxCommand) -> Result<(), SessionClosed> {
        self.tx.send(command).await.map_err(|_| SessionClosed)
    }

    async fn ask<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> InboxCommand) -> Result<T, SessionClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| SessionClosed)
    }

    pub async fn load_snapshot(&self, snapshot: Vec<ConversationSnapshot>) -> Result<(), SessionClosed> {
        self.send(InboxCommand::LoadSnapshot(snapshot)).await
    }

    pub async fn deliver(&self, event: FanoutEvent) -> Result<(), SessionClosed> {
        self.send(InboxCommand::Deliver(event)).await
    }

    pub async fn attach_thread(&self, conversation_id: Uuid, messages: Vec<Message>) -> Result<(), SessionClosed> {
        self.send(InboxCommand::AttachThread {
            conversation_id,
            messages,
        })
        .await
    }

    pub async fn mark_read(&self, conversation_id: Uuid) -> Result<(), SessionClosed> {
        self.send(InboxCommand::MarkRead(conversation_id)).await
    }

    /// Current list, in display order.
    pub async fn entries(&self) -> Result<Vec<ConversationEntry>, SessionClosed> {
        self.ask(InboxCommand::Entries).await
    }

    pub async fn entry(&self, conversation_id: Uuid) -> Result<Option<ConversationEntry>, SessionClosed> {
        self.ask(|reply| InboxCommand::Entry(conversation_id, reply)).await
    }

    pub async fn total_unread(&self) -> Result<u32, SessionClosed> {
        self.ask(InboxCommand::TotalUnread).await
    }

    pub async fn shutdown(&self) -> Result<(), SessionClosed> {
        self.send(InboxCommand::Shutdown).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Closed(#[from] SessionClosed),
}

/// Fetch an authoritative list and hand it to the session.
pub async fn refresh(store: &HttpStore, scope: Scope, inbox: &InboxHandle) -> Result<usize, RefreshError> {
    let conversations = store.list_conversations(scope).await?;
    let count = conversations.len();
    inbox
        .load_snapshot(conversations.into_iter().map(ConversationSnapshot::from).collect())
        .await?;
    Ok(count)
}

/// Fetch one thread and attach it, e.g. when the conversation is expanded.
/// Also clears its unread count.
pub async fn open_thread(store: &HttpStore, conversation_id: Uuid, inbox: &InboxHandle) -> Result<usize, RefreshError> {
    let messages = store.get_messages(conversation_id).await?;
    let count = messages.len();
    inbox.attach_thread(conversation_id, messages).await?;
    inbox.mark_read(conversation_id).await?;
    Ok(count)
}
