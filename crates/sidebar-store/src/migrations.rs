use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS channels (
            id              TEXT PRIMARY KEY,
            kind            TEXT NOT NULL CHECK (kind IN ('direct', 'group')),
            direct_key      TEXT UNIQUE,
            owner_id        TEXT,
            last_message_id TEXT,
            last_message_at TEXT,
            is_deleted      INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS channel_participants (
            channel_id  TEXT NOT NULL REFERENCES channels(id),
            user_id     TEXT NOT NULL,
            position    INTEGER NOT NULL,
            PRIMARY KEY (channel_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON channel_participants(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id                      TEXT PRIMARY KEY,
            channel_id              TEXT NOT NULL REFERENCES channels(id),
            author_id               TEXT NOT NULL,
            content                 TEXT,
            referenced_message_id   TEXT,
            created_at              TEXT NOT NULL,
            edited_at               TEXT,
            is_deleted              INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_channel
            ON messages(channel_id, created_at);

        CREATE TABLE IF NOT EXISTS message_attachments (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            position    INTEGER NOT NULL,
            url         TEXT NOT NULL,
            PRIMARY KEY (message_id, position)
        );

        CREATE TABLE IF NOT EXISTS reactions (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL,
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id, emoji)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);

        CREATE TABLE IF NOT EXISTS read_receipts (
            channel_id              TEXT NOT NULL,
            user_id                 TEXT NOT NULL,
            last_read_at            TEXT NOT NULL,
            last_read_message_id    TEXT,
            PRIMARY KEY (channel_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS friendships (
            user_lo     TEXT NOT NULL,
            user_hi     TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (user_lo, user_hi)
        );

        CREATE TABLE IF NOT EXISTS blocks (
            blocker_id  TEXT NOT NULL,
            blocked_id  TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (blocker_id, blocked_id)
        );
        ",
    )?;

    info!("database migrations complete");
    Ok(())
}
