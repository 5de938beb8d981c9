use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Directory tables are owned by the profile system; the messaging
        -- core only reads them.
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            role        TEXT NOT NULL CHECK (role IN ('founder', 'investor')),
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS startups (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS startup_founders (
            startup_id  TEXT NOT NULL REFERENCES startups(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            position    INTEGER NOT NULL,
            PRIMARY KEY (startup_id, user_id)
        );

        -- Timestamps are RFC 3339 UTC with fixed microsecond precision, so
        -- text order is time order.
        CREATE TABLE IF NOT EXISTS conversations (
            id                      TEXT PRIMARY KEY,
            startup_id              TEXT NOT NULL REFERENCES startups(id),
            investor_id             TEXT NOT NULL REFERENCES users(id),
            is_team_chat            INTEGER NOT NULL DEFAULT 0,
            last_message_content    TEXT,
            last_message_sender_id  TEXT,
            last_message_at         TEXT NOT NULL,
            message_count           INTEGER NOT NULL DEFAULT 0,
            created_at              TEXT NOT NULL
        );

        -- One direct thread per (startup, investor)
        CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_direct_pair
            ON conversations(startup_id, investor_id)
            WHERE is_team_chat = 0;

        CREATE INDEX IF NOT EXISTS idx_conversations_startup
            ON conversations(startup_id, last_message_at);

        CREATE TABLE IF NOT EXISTS conversation_participants (
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            user_id          TEXT NOT NULL REFERENCES users(id),
            role             TEXT NOT NULL,
            position         INTEGER NOT NULL,
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON conversation_participants(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id               TEXT PRIMARY KEY,
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            sender_id        TEXT NOT NULL REFERENCES users(id),
            content          TEXT NOT NULL,
            kind             TEXT NOT NULL DEFAULT 'text',
            read_by          TEXT NOT NULL DEFAULT '[]',
            created_at       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
