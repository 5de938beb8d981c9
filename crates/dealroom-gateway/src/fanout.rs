use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use dealroom_types::events::{ChannelName, FanoutEvent};
use dealroom_types::models::{Conversation, Message};

/// The publish half of a pub/sub transport.
pub trait Publisher: Send + Sync {
    /// Hand an event to the channel's current subscribers. Returns how many
    /// received it; zero is not an error.
    fn publish(&self, channel: &ChannelName, event: FanoutEvent) -> anyhow::Result<usize>;
}

/// Turns persisted creates into transport publishes.
///
/// Runs after the write is durable. Failures are logged and swallowed so a
/// notification problem never undoes or fails the write that triggered it.
#[derive(Clone)]
pub struct Fanout {
    publisher: Arc<dyn Publisher>,
}

impl Fanout {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    /// `new-message` on `entity:{startupId}`.
    pub fn message_appended(&self, startup_id: Uuid, message: &Message) {
        self.publish(
            ChannelName::Entity(startup_id),
            FanoutEvent::new_message(message.clone()),
        );
    }

    /// `new-conversation` on `user:{recipientId}`.
    pub fn conversation_created(&self, recipient_id: Uuid, conversation: &Conversation) {
        self.publish(
            ChannelName::User(recipient_id),
            FanoutEvent::new_conversation(conversation.clone()),
        );
    }

    fn publish(&self, channel: ChannelName, event: FanoutEvent) {
        let name = event.name();
        match self.publisher.publish(&channel, event) {
            Ok(delivered) => debug!("Published {} to {} ({} subscribers)", name, channel, delivered),
            Err(e) => warn!("Dropping {} for {}: {:#}", name, channel, e),
        }
    }
}
