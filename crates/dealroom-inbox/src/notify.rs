//! Side-channel alerts (desktop notification, badge, sound) raised when a
//! message from someone else lands in the viewer's inbox.

use dealroom_types::models::{Conversation, Message};

/// Receives one call per applied message that the viewer did not send.
/// Implementations might raise an OS notification, bump a badge, or
/// discard the call.
pub trait Notifier: Send + Sync {
    fn notify(&self, conversation: &Conversation, message: &Message);
}

/// Notifier that uses the `tracing` crate.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, conversation: &Conversation, message: &Message) {
        tracing::info!(
            conversation_id = %conversation.id,
            sender = %message.sender_name,
            "new message ({} chars)",
            message.content.chars().count(),
        );
    }
}

/// No-op notifier that discards every alert.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _conversation: &Conversation, _message: &Message) {}
}
