//! CRUD operations for [`Conversation`] records.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use toloko_shared::{ConversationId, MessageId, UserId};

use crate::database::{parse_timestamp, Database};
use crate::error::{Result, StoreError};
use crate::models::{canonical_pair, Conversation};

const CONVERSATION_COLUMNS: &str =
    "id, user_a_id, user_b_id, last_message_id, created_at, updated_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert the conversation for `(initiator, other)` unless one already
    /// exists for the pair in either order, then return the stored row.
    ///
    /// Relies on the unique `(user_low, user_high)` index, so two racing
    /// callers both end up with the same row.
    pub fn insert_conversation_if_absent(
        &self,
        initiator: UserId,
        other: UserId,
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        let (low, high) = canonical_pair(initiator, other);
        let inserted = self.conn().execute(
            "INSERT INTO conversations
                 (user_a_id, user_b_id, user_low, user_high, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(user_low, user_high) DO NOTHING",
            params![initiator.0, other.0, low.0, high.0, now.to_rfc3339()],
        )?;

        if inserted > 0 {
            tracing::debug!(user_a = %initiator, user_b = %other, "conversation created");
        }

        self.find_conversation_between(initiator, other)?
            .ok_or(StoreError::NotFound)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Look up the conversation for an unordered pair.
    pub fn find_conversation_between(&self, a: UserId, b: UserId) -> Result<Option<Conversation>> {
        let (low, high) = canonical_pair(a, b);
        let conv = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE user_low = ?1 AND user_high = ?2"
                ),
                params![low.0, high.0],
                row_to_conversation,
            )
            .optional()?;
        Ok(conv)
    }

    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.0],
                row_to_conversation,
            )
            .map_err(StoreError::from_query)
    }

    /// Conversations the user takes part in, most recently active first.
    pub fn list_conversations_for_user(
        &self,
        user: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE user_a_id = ?1 OR user_b_id = ?1
             ORDER BY updated_at DESC, id DESC
             LIMIT ?2 OFFSET ?3"
        ))?;

        let rows = stmt.query_map(params![user.0, limit, offset], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    /// Messages in the conversation addressed to `reader` that are not yet
    /// read.
    pub fn count_unread(&self, conversation: ConversationId, reader: UserId) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ?1 AND to_user_id = ?2 AND status <> 'read'",
            params![conversation.0, reader.0],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let created_str: String = row.get(4)?;
    let updated_str: String = row.get(5)?;

    Ok(Conversation {
        id: ConversationId(row.get(0)?),
        user_a_id: UserId(row.get(1)?),
        user_b_id: UserId(row.get(2)?),
        last_message_id: row.get::<_, Option<i64>>(3)?.map(MessageId),
        created_at: parse_timestamp(4, &created_str)?,
        updated_at: parse_timestamp(5, &updated_str)?,
    })
}
