//! Database row types. These map directly to SQLite rows and are converted to
//! the shared dealroom-types models at the crate boundary.
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use tracing::warn;
use uuid::Uuid;

use dealroom_types::models::{Conversation, LastMessage, Message, Participant, Role};

pub struct ConversationRow {
    pub id: String,
    pub startup_id: String,
    pub investor_id: String,
    pub is_team_chat: bool,
    pub last_message_content: Option<String>,
    pub last_message_sender_id: Option<String>,
    pub last_message_at: String,
    pub message_count: i64,
    pub created_at: String,
}

pub struct ParticipantRow {
    pub conversation_id: String,
    pub user_id: String,
    pub role: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_role: String,
    pub content: String,
    pub kind: String,
    pub read_by: String,
    pub created_at: String,
}

/// Storage precision. Values are truncated before use so what callers see is
/// exactly what a later read returns.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str, context: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') has no timezone suffix
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}' on {}: {}", raw, context, e);
            DateTime::default()
        })
}

pub fn parse_id(raw: &str, context: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt id '{}' on {}: {}", raw, context, e);
        Uuid::default()
    })
}

fn parse_role(raw: &str, context: &str) -> Role {
    raw.parse().unwrap_or_else(|e| {
        warn!("{} on {}", e, context);
        Role::Founder
    })
}

impl ParticipantRow {
    pub fn into_model(self) -> Participant {
        Participant {
            user_id: parse_id(&self.user_id, &self.conversation_id),
            role: parse_role(&self.role, &self.conversation_id),
        }
    }
}

impl ConversationRow {
    pub fn into_model(self, participants: Vec<Participant>) -> Conversation {
        let last_message_at = parse_ts(&self.last_message_at, &self.id);
        let last_message = match (self.last_message_content, self.last_message_sender_id) {
            (Some(content), Some(sender_id)) => Some(LastMessage {
                content,
                sent_at: last_message_at,
                sender_id: parse_id(&sender_id, &self.id),
            }),
            _ => None,
        };

        Conversation {
            id: parse_id(&self.id, "conversation"),
            startup_id: parse_id(&self.startup_id, &self.id),
            participants,
            is_team_chat: self.is_team_chat,
            last_message,
            last_message_at,
            message_count: self.message_count.max(0) as u64,
            created_at: parse_ts(&self.created_at, &self.id),
        }
    }
}

impl MessageRow {
    pub fn into_model(self) -> Message {
        let read_by: Vec<Uuid> = serde_json::from_str(&self.read_by).unwrap_or_else(|e| {
            warn!("Corrupt read_by on message '{}': {}", self.id, e);
            Vec::new()
        });

        Message {
            id: parse_id(&self.id, "message"),
            conversation_id: parse_id(&self.conversation_id, &self.id),
            sender_id: parse_id(&self.sender_id, &self.id),
            sender_name: self.sender_name,
            sender_role: parse_role(&self.sender_role, &self.id),
            content: self.content,
            kind: self.kind,
            created_at: parse_ts(&self.created_at, &self.id),
            read_by,
        }
    }
}
