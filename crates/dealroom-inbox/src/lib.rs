//! Consumer side of the messaging core.
//!
//! - `reconciler`: merges snapshots and fan-out events into one ordered,
//!   deduplicated conversation list
//! - `controller`: per-conversation UI state (expand, drafts, send guard)
//! - `session`: single-task actor owning the reconciler
//! - `store` / `gateway`: HTTP and WebSocket clients for the server

pub mod controller;
pub mod gateway;
pub mod notify;
pub mod reconciler;
pub mod session;
pub mod store;
pub mod time;

pub use controller::{Key, KeyAction, KeyPress, PendingSend, SendError, ThreadController, UiEffect};
pub use gateway::GatewayClient;
pub use notify::{Notifier, NullNotifier, TracingNotifier};
pub use reconciler::{ApplyOutcome, ConversationEntry, ConversationSnapshot, Reconciler, Viewer};
pub use session::{InboxHandle, RefreshError, SessionClosed, open_thread, refresh, spawn_inbox};
pub use store::{HttpStore, MessageSink, Scope, StoreError};
pub use time::format_relative_time;
