//! v001 -- Initial schema creation.
//!
//! Creates the five messaging tables: `conversations`, `messages`,
//! `attachments`, `blocks` and `presence`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations (strictly pairwise)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    user_a_id       INTEGER NOT NULL,            -- initiator
    user_b_id       INTEGER NOT NULL,
    user_low        INTEGER NOT NULL,            -- min(user_a_id, user_b_id)
    user_high       INTEGER NOT NULL,            -- max(user_a_id, user_b_id)
    last_message_id INTEGER,                     -- cache, not ownership
    created_at      TEXT NOT NULL,               -- RFC-3339
    updated_at      TEXT NOT NULL,

    CHECK (user_a_id <> user_b_id),
    FOREIGN KEY (last_message_id) REFERENCES messages(id) ON DELETE SET NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_pair
    ON conversations(user_low, user_high);
CREATE INDEX IF NOT EXISTS idx_conversations_user_a ON conversations(user_a_id);
CREATE INDEX IF NOT EXISTS idx_conversations_user_b ON conversations(user_b_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL,
    from_user_id    INTEGER NOT NULL,
    to_user_id      INTEGER NOT NULL,
    text            TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'sent'
                    CHECK (status IN ('sent', 'delivered', 'read')),
    temp_id         TEXT,                        -- client correlation token
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, id DESC);
CREATE INDEX IF NOT EXISTS idx_messages_unread
    ON messages(to_user_id, status);

-- ----------------------------------------------------------------
-- Attachments (owned by their message)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS attachments (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id  INTEGER NOT NULL,
    file_path   TEXT NOT NULL,
    mime_type   TEXT NOT NULL,
    size        INTEGER NOT NULL,
    uploaded_by INTEGER NOT NULL,
    created_at  TEXT NOT NULL,

    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id);

-- ----------------------------------------------------------------
-- Blocks (directed)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS blocks (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    blocker_id INTEGER NOT NULL,
    blocked_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,

    CHECK (blocker_id <> blocked_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_blocks_pair ON blocks(blocker_id, blocked_id);
CREATE INDEX IF NOT EXISTS idx_blocks_blocked ON blocks(blocked_id);

-- ----------------------------------------------------------------
-- Presence (one row per user)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS presence (
    user_id      INTEGER PRIMARY KEY NOT NULL,
    is_online    INTEGER NOT NULL DEFAULT 0,     -- boolean 0/1
    last_seen_at TEXT,
    updated_at   TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
