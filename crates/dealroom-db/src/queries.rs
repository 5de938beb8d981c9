use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;
use uuid::Uuid;

use dealroom_types::models::{Conversation, Message, Participant, Role, Startup, User};

use crate::Database;
use crate::models::{self, ConversationRow, MessageRow, ParticipantRow, format_ts};

/// Result of an append attempt. Rejections are expected outcomes, not
/// storage failures.
#[derive(Debug)]
pub enum AppendOutcome {
    Appended(Message),
    ConversationNotFound,
    NotParticipant,
}

const CONVERSATION_COLUMNS: &str = "c.id, c.startup_id, c.investor_id, c.is_team_chat, \
     c.last_message_content, c.last_message_sender_id, c.last_message_at, \
     c.message_count, c.created_at";

impl Database {
    // -- Directory --

    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, role) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, role = excluded.role",
                params![user.id.to_string(), user.name, user.role.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, name, role FROM users WHERE id = ?1",
                    [id.to_string()],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
                )
                .optional()?;

            row.map(|(id, name, role)| {
                Ok(User {
                    id: models::parse_id(&id, "user"),
                    name,
                    role: role.parse()?,
                })
            })
            .transpose()
        })
    }

    /// Insert or replace a startup and its ordered founders list.
    pub fn upsert_startup(&self, startup: &Startup) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let sid = startup.id.to_string();
            tx.execute(
                "INSERT INTO startups (id, name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                params![sid, startup.name],
            )?;
            tx.execute("DELETE FROM startup_founders WHERE startup_id = ?1", [&sid])?;
            for (position, founder) in startup.founders.iter().enumerate() {
                tx.execute(
                    "INSERT INTO startup_founders (startup_id, user_id, position) VALUES (?1, ?2, ?3)",
                    params![sid, founder.to_string(), position as i64],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_startup(&self, id: Uuid) -> Result<Option<Startup>> {
        self.with_conn(|conn| {
            let name: Option<String> = conn
                .query_row("SELECT name FROM startups WHERE id = ?1", [id.to_string()], |row| row.get(0))
                .optional()?;

            let Some(name) = name else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT user_id FROM startup_founders WHERE startup_id = ?1 ORDER BY position ASC",
            )?;
            let founders = stmt
                .query_map([id.to_string()], |row| row.get::<_, String>(0))?
                .map(|r| r.map(|raw| models::parse_id(&raw, "startup_founders")))
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(Some(Startup { id, name, founders }))
        })
    }

    pub fn is_founder(&self, startup_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM startup_founders WHERE startup_id = ?1 AND user_id = ?2",
                    [startup_id.to_string(), user_id.to_string()],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Founders of the startup, or anyone taking part in one of its
    /// conversations, may watch the startup's entity channel.
    pub fn can_view_startup(&self, user_id: Uuid, startup_id: Uuid) -> Result<bool> {
        if self.is_founder(startup_id, user_id)? {
            return Ok(true);
        }
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM conversations c
                     JOIN conversation_participants p ON p.conversation_id = c.id
                     WHERE c.startup_id = ?1 AND p.user_id = ?2
                     LIMIT 1",
                    [startup_id.to_string(), user_id.to_string()],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    // -- Conversations --

    /// Create the direct (non-team) conversation between a startup and an
    /// investor, or return the one that already exists.
    /// Returns (conversation, created).
    pub fn create_direct_conversation(
        &self,
        startup_id: Uuid,
        founder_id: Uuid,
        investor_id: Uuid,
    ) -> Result<(Conversation, bool)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let id = Uuid::new_v4().to_string();
            let now = format_ts(models::now());
            let sid = startup_id.to_string();
            let iid = investor_id.to_string();

            // The partial unique index turns a duplicate pair into a no-op
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO conversations
                     (id, startup_id, investor_id, is_team_chat, last_message_at, message_count, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4, 0, ?4)",
                params![id, sid, iid, now],
            )?;

            if inserted == 1 {
                let participants = [(founder_id, Role::Founder), (investor_id, Role::Investor)];
                for (position, (user_id, role)) in participants.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO conversation_participants (conversation_id, user_id, role, position)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![id, user_id.to_string(), role.as_str(), position as i64],
                    )?;
                }
            }

            let sql = format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations c
                 WHERE c.startup_id = ?1 AND c.investor_id = ?2 AND c.is_team_chat = 0"
            );
            let rows = query_conversation_rows(&tx, &sql, params![sid, iid])?;
            let mut conversations = attach_participants(&tx, rows)?;
            tx.commit()?;

            let conversation = conversations
                .pop()
                .ok_or_else(|| anyhow::anyhow!("conversation vanished after insert"))?;
            debug!(
                "Direct conversation {} for startup {} / investor {} (created: {})",
                conversation.id, startup_id, investor_id, inserted == 1
            );
            Ok((conversation, inserted == 1))
        })
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1");
            let rows = query_conversation_rows(conn, &sql, params![id.to_string()])?;
            Ok(attach_participants(conn, rows)?.pop())
        })
    }

    /// Startup scope: every conversation of the startup, newest first.
    pub fn list_conversations_for_startup(&self, startup_id: Uuid) -> Result<Vec<Conversation>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations c
                 WHERE c.startup_id = ?1
                 ORDER BY c.last_message_at DESC, c.id ASC"
            );
            let rows = query_conversation_rows(conn, &sql, params![startup_id.to_string()])?;
            attach_participants(conn, rows)
        })
    }

    /// User scope: every conversation the user takes part in, newest first.
    pub fn list_conversations_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations c
                 JOIN conversation_participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY c.last_message_at DESC, c.id ASC"
            );
            let rows = query_conversation_rows(conn, &sql, params![user_id.to_string()])?;
            attach_participants(conn, rows)
        })
    }

    pub fn count_conversations(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
            Ok(n as u64)
        })
    }

    // -- Messages --

    /// Append a message and patch the conversation's cached projection in the
    /// same transaction. `created_at` is strictly increasing per conversation.
    pub fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        kind: &str,
    ) -> Result<AppendOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let cid = conversation_id.to_string();
            let uid = sender_id.to_string();

            let last_at: Option<String> = tx
                .query_row(
                    "SELECT last_message_at FROM conversations WHERE id = ?1",
                    [&cid],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(last_at) = last_at else {
                return Ok(AppendOutcome::ConversationNotFound);
            };

            let sender: Option<(String, String)> = tx
                .query_row(
                    "SELECT u.name, p.role FROM conversation_participants p
                     JOIN users u ON u.id = p.user_id
                     WHERE p.conversation_id = ?1 AND p.user_id = ?2",
                    [&cid, &uid],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((sender_name, sender_role)) = sender else {
                return Ok(AppendOutcome::NotParticipant);
            };

            let created_at = next_timestamp(models::parse_ts(&last_at, &cid), models::now());
            let created = format_ts(created_at);
            let id = Uuid::new_v4();
            let read_by = serde_json::to_string(&[sender_id])?;

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, kind, read_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![id.to_string(), cid, uid, content, kind, read_by, created],
            )?;
            tx.execute(
                "UPDATE conversations
                 SET last_message_content = ?2,
                     last_message_sender_id = ?3,
                     last_message_at = ?4,
                     message_count = message_count + 1
                 WHERE id = ?1",
                params![cid, content, uid, created],
            )?;
            tx.commit()?;

            Ok(AppendOutcome::Appended(
                MessageRow {
                    id: id.to_string(),
                    conversation_id: cid,
                    sender_id: uid,
                    sender_name,
                    sender_role,
                    content: content.to_string(),
                    kind: kind.to_string(),
                    read_by,
                    created_at: created,
                }
                .into_model(),
            ))
        })
    }

    pub fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2",
                    [conversation_id.to_string(), user_id.to_string()],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Full thread, oldest first.
    pub fn get_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        self.with_conn(|conn| query_messages(conn, &conversation_id.to_string()))
    }
}

/// A message may not share or precede the timestamp of the conversation's
/// current head.
fn next_timestamp(last: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > last {
        now
    } else {
        last + Duration::microseconds(1)
    }
}

fn query_conversation_rows(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<ConversationRow>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(ConversationRow {
                id: row.get(0)?,
                startup_id: row.get(1)?,
                investor_id: row.get(2)?,
                is_team_chat: row.get(3)?,
                last_message_content: row.get(4)?,
                last_message_sender_id: row.get(5)?,
                last_message_at: row.get(6)?,
                message_count: row.get(7)?,
                created_at: row.get(8)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Batch-load participants for a set of conversation rows, keeping row order.
fn attach_participants(conn: &Connection, rows: Vec<ConversationRow>) -> Result<Vec<Conversation>> {
    if rows.is_empty() {
        return Ok(vec![]);
    }

    let placeholders: Vec<String> = (1..=rows.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "SELECT conversation_id, user_id, role FROM conversation_participants
         WHERE conversation_id IN ({})
         ORDER BY conversation_id, position ASC",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> = rows
        .iter()
        .map(|r| &r.id as &dyn rusqlite::types::ToSql)
        .collect();

    let participant_rows = stmt
        .query_map(params.as_slice(), |row| {
            Ok(ParticipantRow {
                conversation_id: row.get(0)?,
                user_id: row.get(1)?,
                role: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut by_conversation: HashMap<String, Vec<Participant>> = HashMap::new();
    for p in participant_rows {
        by_conversation
            .entry(p.conversation_id.clone())
            .or_default()
            .push(p.into_model());
    }

    Ok(rows
        .into_iter()
        .map(|row| {
            let participants = by_conversation.remove(&row.id).unwrap_or_default();
            row.into_model(participants)
        })
        .collect())
}

fn query_messages(conn: &Connection, conversation_id: &str) -> Result<Vec<Message>> {
    // Role comes from the participant row, matching what append reports
    let mut stmt = conn.prepare(
        "SELECT m.id, m.conversation_id, m.sender_id, u.name, p.role, m.content, m.kind, m.read_by, m.created_at
         FROM messages m
         LEFT JOIN users u ON m.sender_id = u.id
         LEFT JOIN conversation_participants p
                ON p.conversation_id = m.conversation_id AND p.user_id = m.sender_id
         WHERE m.conversation_id = ?1
         ORDER BY m.created_at ASC, m.id ASC",
    )?;

    let rows = stmt
        .query_map([conversation_id], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                sender_id: row.get(2)?,
                sender_name: row.get::<_, Option<String>>(3)?.unwrap_or_else(|| "unknown".to_string()),
                sender_role: row.get::<_, Option<String>>(4)?.unwrap_or_else(|| "founder".to_string()),
                content: row.get(5)?,
                kind: row.get(6)?,
                read_by: row.get(7)?,
                created_at: row.get(8)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows.into_iter().map(MessageRow::into_model).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        db: Database,
        startup: Startup,
        founder: User,
        investor: User,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let founder = User { id: Uuid::new_v4(), name: "Grace".into(), role: Role::Founder };
        let cofounder = User { id: Uuid::new_v4(), name: "Linus".into(), role: Role::Founder };
        let investor = User { id: Uuid::new_v4(), name: "Ada".into(), role: Role::Investor };
        for u in [&founder, &cofounder, &investor] {
            db.upsert_user(u).unwrap();
        }
        let startup = Startup {
            id: Uuid::new_v4(),
            name: "Lattice".into(),
            founders: vec![founder.id, cofounder.id],
        };
        db.upsert_startup(&startup).unwrap();
        Fixture { db, startup, founder, investor }
    }

    #[test]
    fn startup_keeps_founder_order() {
        let f = fixture();
        let startup = f.db.get_startup(f.startup.id).unwrap().unwrap();
        assert_eq!(startup.founders, f.startup.founders);
        assert_eq!(startup.primary_founder(), Some(f.founder.id));
        assert!(f.db.get_startup(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn direct_conversation_is_unique_per_pair() {
        let f = fixture();
        let (first, created) = f
            .db
            .create_direct_conversation(f.startup.id, f.founder.id, f.investor.id)
            .unwrap();
        assert!(created);
        assert_eq!(first.message_count, 0);
        assert_eq!(first.last_message_at, first.created_at);
        assert_eq!(first.investor_id(), Some(f.investor.id));

        let (second, created) = f
            .db
            .create_direct_conversation(f.startup.id, f.founder.id, f.investor.id)
            .unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.participants, first.participants);
        assert_eq!(f.db.count_conversations().unwrap(), 1);
    }

    #[test]
    fn append_patches_projection_and_keeps_time_monotonic() {
        let f = fixture();
        let (c, _) = f
            .db
            .create_direct_conversation(f.startup.id, f.founder.id, f.investor.id)
            .unwrap();

        let mut sent = Vec::new();
        for (sender, text) in [(f.investor.id, "Hello"), (f.founder.id, "Hi!"), (f.investor.id, "Call?")] {
            match f.db.append_message(c.id, sender, text, "text").unwrap() {
                AppendOutcome::Appended(m) => sent.push(m),
                other => panic!("unexpected {:?}", other),
            }
        }

        assert!(sent.windows(2).all(|w| w[0].created_at < w[1].created_at));
        assert_eq!(sent[0].sender_name, "Ada");
        assert_eq!(sent[1].sender_role, Role::Founder);
        assert_eq!(sent[0].read_by, vec![f.investor.id]);

        let stored = f.db.get_messages(c.id).unwrap();
        assert_eq!(stored, sent);

        let c = f.db.get_conversation(c.id).unwrap().unwrap();
        assert_eq!(c.message_count, 3);
        assert_eq!(c.last_message.as_ref().unwrap().content, "Call?");
        assert!(c.projection_violations(&stored).is_empty());
    }

    #[test]
    fn append_rejects_missing_conversation_and_outsiders() {
        let f = fixture();
        let (c, _) = f
            .db
            .create_direct_conversation(f.startup.id, f.founder.id, f.investor.id)
            .unwrap();

        let outsider = User { id: Uuid::new_v4(), name: "Eve".into(), role: Role::Investor };
        f.db.upsert_user(&outsider).unwrap();

        assert!(matches!(
            f.db.append_message(Uuid::new_v4(), f.investor.id, "x", "text").unwrap(),
            AppendOutcome::ConversationNotFound
        ));
        assert!(matches!(
            f.db.append_message(c.id, outsider.id, "x", "text").unwrap(),
            AppendOutcome::NotParticipant
        ));
        assert_eq!(f.db.get_conversation(c.id).unwrap().unwrap().message_count, 0);
    }

    #[test]
    fn lists_are_scoped_and_newest_first() {
        let f = fixture();
        let other_investor = User { id: Uuid::new_v4(), name: "Bob".into(), role: Role::Investor };
        f.db.upsert_user(&other_investor).unwrap();

        let (a, _) = f
            .db
            .create_direct_conversation(f.startup.id, f.founder.id, f.investor.id)
            .unwrap();
        let (b, _) = f
            .db
            .create_direct_conversation(f.startup.id, f.founder.id, other_investor.id)
            .unwrap();
        f.db.append_message(a.id, f.investor.id, "bump", "text").unwrap();

        let for_startup = f.db.list_conversations_for_startup(f.startup.id).unwrap();
        let ids: Vec<Uuid> = for_startup.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);

        let for_investor = f.db.list_conversations_for_user(other_investor.id).unwrap();
        assert_eq!(for_investor.len(), 1);
        assert_eq!(for_investor[0].id, b.id);

        assert!(f.db.can_view_startup(other_investor.id, f.startup.id).unwrap());
        assert!(f.db.can_view_startup(f.founder.id, f.startup.id).unwrap());
        assert!(!f.db.can_view_startup(Uuid::new_v4(), f.startup.id).unwrap());
    }

    #[test]
    fn fetched_thread_reports_the_participant_role() {
        let f = fixture();
        let (c, _) = f
            .db
            .create_direct_conversation(f.startup.id, f.founder.id, f.investor.id)
            .unwrap();
        let AppendOutcome::Appended(sent) = f.db.append_message(c.id, f.investor.id, "Hello", "text").unwrap() else {
            panic!("append failed");
        };

        // Directory role changes later; the thread keeps the role the sender held in it
        let switched = User { role: Role::Founder, ..f.investor.clone() };
        f.db.upsert_user(&switched).unwrap();

        let stored = f.db.get_messages(c.id).unwrap();
        assert_eq!(stored[0].sender_role, Role::Investor);
        assert_eq!(stored[0].sender_role, sent.sender_role);
        assert!(f.db.is_participant(c.id, f.investor.id).unwrap());
        assert!(!f.db.is_participant(c.id, Uuid::new_v4()).unwrap());
    }

    #[test]
    fn next_timestamp_never_goes_backwards() {
        let last = models::now();
        assert_eq!(next_timestamp(last, last), last + Duration::microseconds(1));
        assert_eq!(next_timestamp(last, last - Duration::seconds(5)), last + Duration::microseconds(1));
        let later = last + Duration::seconds(1);
        assert_eq!(next_timestamp(last, later), later);
    }
}
