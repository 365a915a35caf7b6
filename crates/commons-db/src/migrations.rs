use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// Timestamps are stored as INTEGER microseconds since the Unix epoch so that
/// ordering and cursor comparisons are exact.
pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Mirror of the identity service's display profiles
        CREATE TABLE IF NOT EXISTS profiles (
            user_id         TEXT PRIMARY KEY,
            display_name    TEXT NOT NULL,
            avatar_url      TEXT,
            role            TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id                  TEXT PRIMARY KEY,
            kind                TEXT NOT NULL CHECK (kind IN ('direct', 'group')),
            name                TEXT,
            created_by          TEXT NOT NULL,
            -- '<lower uuid>:<higher uuid>' for direct conversations, NULL for groups
            direct_key          TEXT UNIQUE,
            created_at          INTEGER NOT NULL,
            last_activity_at    INTEGER NOT NULL,
            CHECK ((kind = 'direct') = (direct_key IS NOT NULL))
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_activity
            ON conversations(last_activity_at);

        CREATE TABLE IF NOT EXISTS participants (
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            user_id         TEXT NOT NULL,
            role            TEXT NOT NULL CHECK (role IN ('admin', 'member')),
            unread_count    INTEGER NOT NULL DEFAULT 0 CHECK (unread_count >= 0),
            last_read_at    INTEGER,
            joined_at       INTEGER NOT NULL,
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON participants(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            sender_id       TEXT NOT NULL,
            content         TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            is_deleted      INTEGER NOT NULL DEFAULT 0,
            is_edited       INTEGER NOT NULL DEFAULT 0,
            edited_at       INTEGER
        );

        -- Unique so a history cursor never splits two messages with the same timestamp
        CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        CREATE TABLE IF NOT EXISTS message_attachments (
            message_id      TEXT NOT NULL REFERENCES messages(id),
            position        INTEGER NOT NULL,
            locator         TEXT NOT NULL,
            file_name       TEXT,
            content_type    TEXT,
            PRIMARY KEY (message_id, position)
        );

        -- Append-only: nothing ever deletes from this table
        CREATE TABLE IF NOT EXISTS read_receipts (
            message_id      TEXT NOT NULL REFERENCES messages(id),
            user_id         TEXT NOT NULL,
            read_at         INTEGER NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS reactions (
            id          TEXT PRIMARY KEY,
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL,
            emoji       TEXT NOT NULL,
            created_at  INTEGER NOT NULL,
            UNIQUE(message_id, user_id, emoji)
        );

        -- At most one active reaction per (message, user)
        CREATE UNIQUE INDEX IF NOT EXISTS idx_reactions_one_per_user
            ON reactions(message_id, user_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
