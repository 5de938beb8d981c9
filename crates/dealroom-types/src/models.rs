use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message type assigned when the sender does not pick one.
pub const DEFAULT_MESSAGE_KIND: &str = "text";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Founder,
    Investor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Founder => "founder",
            Self::Investor => "investor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "founder" => Ok(Self::Founder),
            "investor" => Ok(Self::Investor),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub role: Role,
}

/// Startup directory entry. `founders` is ordered; the first entry is the
/// primary founder that receives investor outreach.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Startup {
    pub id: Uuid,
    pub name: String,
    pub founders: Vec<Uuid>,
}

impl Startup {
    pub fn primary_founder(&self) -> Option<Uuid> {
        self.founders.first().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: Uuid,
    pub role: Role,
}

/// Denormalized copy of the newest message in a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub sender_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub startup_id: Uuid,
    pub participants: Vec<Participant>,
    pub is_team_chat: bool,
    pub last_message: Option<LastMessage>,
    /// Sort key. Equals `last_message.sent_at`, or `created_at` while the
    /// thread is empty.
    pub last_message_at: DateTime<Utc>,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub sender_role: Role,
    pub content: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_by: Vec<Uuid>,
}

fn default_kind() -> String {
    DEFAULT_MESSAGE_KIND.to_string()
}

impl Message {
    /// Thread order: `created_at` ascending, id as tie-break.
    pub fn thread_order(a: &Message, b: &Message) -> Ordering {
        a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
    }

    pub fn to_last_message(&self) -> LastMessage {
        LastMessage {
            content: self.content.clone(),
            sent_at: self.created_at,
            sender_id: self.sender_id,
        }
    }
}

/// A mismatch between a conversation's cached projection and its messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectionViolation {
    #[error("message_count is {cached}, thread has {actual}")]
    MessageCount { cached: u64, actual: u64 },
    #[error("last_message does not mirror the newest message")]
    LastMessage,
    #[error("last_message_at {cached} != expected {expected}")]
    LastMessageAt {
        cached: DateTime<Utc>,
        expected: DateTime<Utc>,
    },
}

impl Conversation {
    /// List order: most recent `last_message_at` first, then id ascending so
    /// equal timestamps never reshuffle.
    pub fn recency_order(a: &Conversation, b: &Conversation) -> Ordering {
        b.last_message_at
            .cmp(&a.last_message_at)
            .then_with(|| a.id.cmp(&b.id))
    }

    pub fn investor_id(&self) -> Option<Uuid> {
        self.participants
            .iter()
            .find(|p| p.role == Role::Investor)
            .map(|p| p.user_id)
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    /// Incrementally fold one new message into the projection.
    ///
    /// Always bumps `message_count`. `last_message` and `last_message_at`
    /// only move forward: a message older than the current head leaves them
    /// alone. Returns whether `last_message_at` changed.
    pub fn record_message(&mut self, message: &Message) -> bool {
        self.message_count += 1;

        let advances = match &self.last_message {
            None => true,
            Some(_) => message.created_at >= self.last_message_at,
        };

        if advances {
            let moved = self.last_message_at != message.created_at || self.last_message.is_none();
            self.last_message = Some(message.to_last_message());
            self.last_message_at = message.created_at;
            return moved;
        }

        false
    }

    /// Rebuild the projection from the authoritative thread.
    pub fn recompute_projection(&mut self, messages: &[Message]) {
        self.message_count = messages.len() as u64;
        match messages.iter().max_by(|a, b| Message::thread_order(a, b)) {
            Some(newest) => {
                self.last_message = Some(newest.to_last_message());
                self.last_message_at = newest.created_at;
            }
            None => {
                self.last_message = None;
                self.last_message_at = self.created_at;
            }
        }
    }

    /// Compare the cached projection against a full thread.
    pub fn projection_violations(&self, messages: &[Message]) -> Vec<ProjectionViolation> {
        let mut expected = self.clone();
        expected.recompute_projection(messages);

        let mut violations = Vec::new();
        if self.message_count != expected.message_count {
            violations.push(ProjectionViolation::MessageCount {
                cached: self.message_count,
                actual: expected.message_count,
            });
        }
        if self.last_message != expected.last_message {
            violations.push(ProjectionViolation::LastMessage);
        }
        if self.last_message_at != expected.last_message_at {
            violations.push(ProjectionViolation::LastMessageAt {
                cached: self.last_message_at,
                expected: expected.last_message_at,
            });
        }
        violations
    }
}
