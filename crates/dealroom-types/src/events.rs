use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::models::{Conversation, Message, Role};

/// Pub/sub channel address. The string forms `entity:{startupId}` and
/// `user:{userId}` are shared with external dashboards and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelName {
    /// Broadcast surface for everyone viewing a startup's conversations.
    Entity(Uuid),
    /// Private notifications for a single user.
    User(Uuid),
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(id) => write!(f, "entity:{}", id),
            Self::User(id) => write!(f, "user:{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelParseError {
    #[error("channel name has no scope prefix: {0}")]
    MissingScope(String),
    #[error("unknown channel scope: {0}")]
    UnknownScope(String),
    #[error("invalid id in channel name: {0}")]
    InvalidId(String),
}

impl FromStr for ChannelName {
    type Err = ChannelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scope, id) = s
            .split_once(':')
            .ok_or_else(|| ChannelParseError::MissingScope(s.to_string()))?;
        let id: Uuid = id
            .parse()
            .map_err(|_| ChannelParseError::InvalidId(s.to_string()))?;

        match scope {
            "entity" => Ok(Self::Entity(id)),
            "user" => Ok(Self::User(id)),
            other => Err(ChannelParseError::UnknownScope(other.to_string())),
        }
    }
}

impl Serialize for ChannelName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChannelName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub conversation_id: Uuid,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConversationPayload {
    pub conversation: Conversation,
}

/// Named events published by the fan-out dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum FanoutEvent {
    /// A message was appended to a conversation of the channel's startup.
    #[serde(rename = "new-message")]
    NewMessage(NewMessagePayload),

    /// A conversation was opened with the channel's user as recipient.
    #[serde(rename = "new-conversation")]
    NewConversation(NewConversationPayload),
}

impl FanoutEvent {
    pub fn new_message(message: Message) -> Self {
        Self::NewMessage(NewMessagePayload {
            conversation_id: message.conversation_id,
            message,
        })
    }

    pub fn new_conversation(conversation: Conversation) -> Self {
        Self::NewConversation(NewConversationPayload { conversation })
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewMessage(_) => "new-message",
            Self::NewConversation(_) => "new-conversation",
        }
    }
}

/// Frames sent by the gateway to a connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum GatewayEvent {
    /// Connection is authenticated and ready for subscriptions.
    Ready { user_id: Uuid, role: Role },

    /// An event delivered on a subscribed channel.
    Event {
        channel: ChannelName,
        event: FanoutEvent,
    },

    /// A subscribe request was refused.
    SubscribeDenied { channel: String, reason: String },
}

/// Frames sent by a client to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_keep_their_wire_form() {
        let id: Uuid = "7f1f3c2e-2d4b-4a55-9a43-2f7e8f9c1b00".parse().unwrap();
        assert_eq!(
            ChannelName::Entity(id).to_string(),
            "entity:7f1f3c2e-2d4b-4a55-9a43-2f7e8f9c1b00"
        );
        assert_eq!(
            "user:7f1f3c2e-2d4b-4a55-9a43-2f7e8f9c1b00".parse::<ChannelName>(),
            Ok(ChannelName::User(id))
        );
    }

    #[test]
    fn bad_channel_names_are_rejected() {
        assert!(matches!(
            "lobby".parse::<ChannelName>(),
            Err(ChannelParseError::MissingScope(_))
        ));
        assert!(matches!(
            "room:7f1f3c2e-2d4b-4a55-9a43-2f7e8f9c1b00".parse::<ChannelName>(),
            Err(ChannelParseError::UnknownScope(_))
        ));
        assert!(matches!(
            "user:not-a-uuid".parse::<ChannelName>(),
            Err(ChannelParseError::InvalidId(_))
        ));
    }

    #[test]
    fn new_message_payload_uses_event_name_and_camel_case() {
        let message: Message = serde_json::from_value(serde_json::json!({
            "id": Uuid::nil(),
            "conversationId": Uuid::nil(),
            "senderId": Uuid::nil(),
            "senderName": "Ada",
            "senderRole": "investor",
            "content": "Hello",
            "createdAt": "2026-03-01T09:00:00Z"
        }))
        .unwrap();

        let value = serde_json::to_value(FanoutEvent::new_message(message)).unwrap();
        assert_eq!(value["event"], "new-message");
        assert!(value["data"]["conversationId"].is_string());
        assert_eq!(value["data"]["message"]["content"], "Hello");
        assert_eq!(value["data"]["message"]["type"], "text");
    }
}
