//! CRUD operations for [`Message`] records.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use toloko_shared::{ConversationId, MessageId, MessageStatus, UserId};

use crate::database::{parse_timestamp, Database};
use crate::error::{Result, StoreError};
use crate::models::{ConversationStats, Message, MessageStats, NewMessage};

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, from_user_id, to_user_id, text, status, temp_id, created_at, updated_at";

impl Database {
    /// Persist a new message with status `sent` and point the conversation's
    /// last-message cache at it, in one transaction.
    pub fn insert_message(&self, new: &NewMessage, now: DateTime<Utc>) -> Result<Message> {
        let ts = now.to_rfc3339();
        let tx = self.conn().unchecked_transaction()?;

        tx.execute(
            "INSERT INTO messages
                 (conversation_id, from_user_id, to_user_id, text, status, temp_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'sent', ?5, ?6, ?6)",
            params![
                new.conversation_id.0,
                new.from_user_id.0,
                new.to_user_id.0,
                new.text,
                new.temp_id,
                ts,
            ],
        )?;
        let id = MessageId(tx.last_insert_rowid());

        let touched = tx.execute(
            "UPDATE conversations SET last_message_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![id.0, ts, new.conversation_id.0],
        )?;
        if touched == 0 {
            return Err(StoreError::NotFound);
        }

        tx.commit()?;

        Ok(Message {
            id,
            conversation_id: new.conversation_id,
            from_user_id: new.from_user_id,
            to_user_id: new.to_user_id,
            text: new.text.clone(),
            status: MessageStatus::Sent,
            temp_id: new.temp_id.clone(),
            attachments: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Fetch a message together with its attachments.
    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        let mut message = self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.0],
                row_to_message,
            )
            .map_err(StoreError::from_query)?;
        message.attachments = self.list_attachments_for_message(id)?;
        Ok(message)
    }

    /// A page of history, newest first. `before` is an exclusive cursor.
    pub fn list_messages(
        &self,
        conversation: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1 AND (?2 IS NULL OR id < ?2)
             ORDER BY id DESC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![conversation.0, before.map(|m| m.0), limit],
            row_to_message,
        )?;

        self.collect_with_attachments(rows)
    }

    /// Move a message forward to `next`.
    ///
    /// Returns `false` when the stored status already ranks at or above
    /// `next`, so status never moves backwards and repeats are no-ops.
    pub fn advance_message_status(
        &self,
        id: MessageId,
        next: MessageStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            &format!(
                "UPDATE messages SET status = ?2, updated_at = ?3
                 WHERE id = ?1 AND {} < ?4",
                status_rank_sql()
            ),
            params![id.0, next.as_str(), now.to_rfc3339(), next.rank()],
        )?;
        Ok(affected > 0)
    }

    /// Mark every unread message addressed to `reader` in the conversation
    /// as read. Returns the transitioned messages with their senders.
    pub fn mark_conversation_read(
        &self,
        conversation: ConversationId,
        reader: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<(MessageId, UserId)>> {
        let tx = self.conn().unchecked_transaction()?;

        let transitioned = {
            let mut stmt = tx.prepare(
                "SELECT id, from_user_id FROM messages
                 WHERE conversation_id = ?1 AND to_user_id = ?2 AND status <> 'read'
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![conversation.0, reader.0], |row| {
                Ok((MessageId(row.get(0)?), UserId(row.get(1)?)))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        tx.execute(
            "UPDATE messages SET status = 'read', updated_at = ?3
             WHERE conversation_id = ?1 AND to_user_id = ?2 AND status <> 'read'",
            params![conversation.0, reader.0, now.to_rfc3339()],
        )?;
        tx.commit()?;

        Ok(transitioned)
    }

    /// Messages sent or received by `user` whose text contains `query`,
    /// newest first. `%` and `_` in the query match literally.
    pub fn search_messages(&self, user: UserId, query: &str, limit: u32) -> Result<Vec<Message>> {
        let pattern = format!("%{}%", escape_like(query));
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE (from_user_id = ?1 OR to_user_id = ?1)
               AND text LIKE ?2 ESCAPE '\\'
             ORDER BY id DESC
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![user.0, pattern, limit], row_to_message)?;
        self.collect_with_attachments(rows)
    }

    /// Every message addressed to `user` that is not yet read, oldest first.
    pub fn list_unread_for_user(&self, user: UserId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE to_user_id = ?1 AND status <> 'read'
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![user.0], row_to_message)?;
        self.collect_with_attachments(rows)
    }

    /// Per-user counters. `since` bounds the `recent_messages` window.
    pub fn message_stats(&self, user: UserId, since: DateTime<Utc>) -> Result<MessageStats> {
        let stats = self.conn().query_row(
            "SELECT
                 COUNT(*),
                 COALESCE(SUM(from_user_id = ?1), 0),
                 COALESCE(SUM(to_user_id = ?1), 0),
                 COALESCE(SUM(to_user_id = ?1 AND status <> 'read'), 0),
                 COALESCE(SUM(created_at > ?2), 0)
             FROM messages
             WHERE from_user_id = ?1 OR to_user_id = ?1",
            params![user.0, since.to_rfc3339()],
            |row| {
                Ok(MessageStats {
                    total_messages: row.get::<_, i64>(0)? as u64,
                    sent_messages: row.get::<_, i64>(1)? as u64,
                    received_messages: row.get::<_, i64>(2)? as u64,
                    unread_messages: row.get::<_, i64>(3)? as u64,
                    recent_messages: row.get::<_, i64>(4)? as u64,
                })
            },
        )?;
        Ok(stats)
    }

    /// Counters for one conversation as seen by `reader`.
    pub fn conversation_stats(
        &self,
        conversation: ConversationId,
        reader: UserId,
    ) -> Result<ConversationStats> {
        let conv = self.get_conversation(conversation)?;
        let total: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation.0],
            |row| row.get(0),
        )?;
        let last_message = match conv.last_message_id {
            Some(id) => Some(self.get_message(id)?),
            None => None,
        };

        Ok(ConversationStats {
            conversation_id: conversation,
            total_messages: total as u64,
            unread_messages: self.count_unread(conversation, reader)?,
            last_message_at: conv.updated_at,
            created_at: conv.created_at,
            last_message,
        })
    }

    /// Delete a message and its attachment rows. The conversation's
    /// last-message cache falls back to the newest remaining message.
    pub fn delete_message(&self, id: MessageId) -> Result<bool> {
        let tx = self.conn().unchecked_transaction()?;

        let conversation: Option<i64> = tx
            .query_row(
                "SELECT conversation_id FROM messages WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;

        let Some(conversation) = conversation else {
            return Ok(false);
        };

        tx.execute("DELETE FROM messages WHERE id = ?1", params![id.0])?;
        tx.execute(
            "UPDATE conversations
             SET last_message_id = (SELECT MAX(id) FROM messages WHERE conversation_id = ?1)
             WHERE id = ?1",
            params![conversation],
        )?;
        tx.commit()?;
        Ok(true)
    }
}

impl Database {
    fn collect_with_attachments(
        &self,
        rows: impl Iterator<Item = rusqlite::Result<Message>>,
    ) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        for row in rows {
            let mut message = row?;
            message.attachments = self.list_attachments_for_message(message.id)?;
            messages.push(message);
        }
        Ok(messages)
    }
}

/// `(CASE status WHEN 'sent' THEN 0 ... END)`, ranked by [`MessageStatus::rank`].
fn status_rank_sql() -> String {
    let arms: String = MessageStatus::ALL
        .iter()
        .map(|s| format!(" WHEN '{}' THEN {}", s.as_str(), s.rank()))
        .collect();
    format!("(CASE status{arms} END)")
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let status_str: String = row.get(5)?;
    let created_str: String = row.get(7)?;
    let updated_str: String = row.get(8)?;

    let status: MessageStatus = status_str.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Message {
        id: MessageId(row.get(0)?),
        conversation_id: ConversationId(row.get(1)?),
        from_user_id: UserId(row.get(2)?),
        to_user_id: UserId(row.get(3)?),
        text: row.get(4)?,
        status,
        temp_id: row.get(6)?,
        attachments: Vec::new(),
        created_at: parse_timestamp(7, &created_str)?,
        updated_at: parse_timestamp(8, &updated_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Conversation;

    fn setup() -> (Database, Conversation) {
        let db = Database::open_in_memory().unwrap();
        let conv = db
            .insert_conversation_if_absent(UserId(1), UserId(2), Utc::now())
            .unwrap();
        (db, conv)
    }

    fn send(db: &Database, conv: &Conversation, from: i64, to: i64, text: &str) -> Message {
        db.insert_message(
            &NewMessage {
                conversation_id: conv.id,
                from_user_id: UserId(from),
                to_user_id: UserId(to),
                text: text.into(),
                temp_id: None,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn insert_updates_last_message() {
        let (db, conv) = setup();
        let msg = db
            .insert_message(
                &NewMessage {
                    conversation_id: conv.id,
                    from_user_id: UserId(1),
                    to_user_id: UserId(2),
                    text: "Hello".into(),
                    temp_id: Some("abc".into()),
                },
                Utc::now(),
            )
            .unwrap();

        assert_eq!(msg.status, MessageStatus::Sent);
        let stored = db.get_message(msg.id).unwrap();
        assert_eq!(stored.text, "Hello");
        assert_eq!(stored.temp_id.as_deref(), Some("abc"));
        assert_eq!(
            db.get_conversation(conv.id).unwrap().last_message_id,
            Some(msg.id)
        );
    }

    #[test]
    fn insert_into_unknown_conversation_fails() {
        let db = Database::open_in_memory().unwrap();
        let result = db.insert_message(
            &NewMessage {
                conversation_id: ConversationId(42),
                from_user_id: UserId(1),
                to_user_id: UserId(2),
                text: "x".into(),
                temp_id: None,
            },
            Utc::now(),
        );
        assert!(result.is_err());
        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn status_only_moves_forward() {
        let (db, conv) = setup();
        let msg = send(&db, &conv, 1, 2, "hi");

        assert!(db
            .advance_message_status(msg.id, MessageStatus::Delivered, Utc::now())
            .unwrap());
        assert!(db
            .advance_message_status(msg.id, MessageStatus::Read, Utc::now())
            .unwrap());
        // Repeats and regressions are no-ops.
        assert!(!db
            .advance_message_status(msg.id, MessageStatus::Read, Utc::now())
            .unwrap());
        assert!(!db
            .advance_message_status(msg.id, MessageStatus::Delivered, Utc::now())
            .unwrap());

        assert_eq!(db.get_message(msg.id).unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn history_pages_newest_first() {
        let (db, conv) = setup();
        let ids: Vec<_> = (0..5)
            .map(|i| send(&db, &conv, 1, 2, &format!("m{i}")).id)
            .collect();

        let page = db.list_messages(conv.id, None, 2).unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ids[4], ids[3]]);

        let next = db.list_messages(conv.id, Some(ids[3]), 10).unwrap();
        assert_eq!(
            next.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![ids[2], ids[1], ids[0]]
        );
    }

    #[test]
    fn mark_conversation_read_only_touches_reader_inbox() {
        let (db, conv) = setup();
        let a = send(&db, &conv, 1, 2, "to two");
        let b = send(&db, &conv, 2, 1, "to one");
        let c = send(&db, &conv, 1, 2, "to two again");

        assert_eq!(db.count_unread(conv.id, UserId(2)).unwrap(), 2);

        let read = db
            .mark_conversation_read(conv.id, UserId(2), Utc::now())
            .unwrap();
        assert_eq!(read, vec![(a.id, UserId(1)), (c.id, UserId(1))]);
        assert_eq!(db.count_unread(conv.id, UserId(2)).unwrap(), 0);
        assert_eq!(db.get_message(b.id).unwrap().status, MessageStatus::Sent);

        assert!(db
            .mark_conversation_read(conv.id, UserId(2), Utc::now())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn delete_rewinds_last_message() {
        let (db, conv) = setup();
        let first = send(&db, &conv, 1, 2, "first");
        let second = send(&db, &conv, 1, 2, "second");

        assert!(db.delete_message(second.id).unwrap());
        assert_eq!(
            db.get_conversation(conv.id).unwrap().last_message_id,
            Some(first.id)
        );

        assert!(db.delete_message(first.id).unwrap());
        assert_eq!(db.get_conversation(conv.id).unwrap().last_message_id, None);
        assert!(!db.delete_message(first.id).unwrap());
        assert!(matches!(db.get_message(first.id), Err(StoreError::NotFound)));
    }

    #[test]
    fn rank_sql_follows_status_order() {
        assert_eq!(
            status_rank_sql(),
            "(CASE status WHEN 'sent' THEN 0 WHEN 'delivered' THEN 1 WHEN 'read' THEN 2 END)"
        );
    }

    #[test]
    fn search_matches_own_messages_only() {
        let (db, conv) = setup();
        let other = db
            .insert_conversation_if_absent(UserId(3), UserId(4), Utc::now())
            .unwrap();
        let first = send(&db, &conv, 1, 2, "Meet at the station");
        send(&db, &conv, 2, 1, "ok");
        let second = send(&db, &conv, 2, 1, "which STATION?");
        send(&db, &other, 3, 4, "station for strangers");

        let found = db.search_messages(UserId(1), "station", 20).unwrap();
        assert_eq!(
            found.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![second.id, first.id]
        );

        assert_eq!(db.search_messages(UserId(1), "station", 1).unwrap().len(), 1);
        assert!(db.search_messages(UserId(5), "station", 20).unwrap().is_empty());
    }

    #[test]
    fn search_wildcards_are_literal() {
        let (db, conv) = setup();
        let percent = send(&db, &conv, 1, 2, "100% sure");
        send(&db, &conv, 1, 2, "1000 sure");

        let found = db.search_messages(UserId(2), "0%", 20).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, percent.id);
        assert!(db.search_messages(UserId(2), "_", 20).unwrap().is_empty());
    }

    #[test]
    fn unread_lists_inbox_oldest_first() {
        let (db, conv) = setup();
        let a = send(&db, &conv, 1, 2, "one");
        send(&db, &conv, 2, 1, "reply");
        let b = send(&db, &conv, 1, 2, "two");
        let c = send(&db, &conv, 1, 2, "three");
        db.advance_message_status(b.id, MessageStatus::Read, Utc::now())
            .unwrap();
        db.advance_message_status(c.id, MessageStatus::Delivered, Utc::now())
            .unwrap();

        let unread = db.list_unread_for_user(UserId(2)).unwrap();
        assert_eq!(
            unread.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![a.id, c.id]
        );
    }

    #[test]
    fn message_stats_counts_each_side() {
        let (db, conv) = setup();
        send(&db, &conv, 1, 2, "a");
        send(&db, &conv, 1, 2, "b");
        let reply = send(&db, &conv, 2, 1, "c");
        send(&db, &conv, 2, 1, "d");
        send(&db, &conv, 2, 1, "e");
        db.advance_message_status(reply.id, MessageStatus::Read, Utc::now())
            .unwrap();

        let stats = db
            .message_stats(UserId(1), Utc::now() - chrono::Duration::hours(24))
            .unwrap();
        assert_eq!(
            stats,
            MessageStats {
                total_messages: 5,
                sent_messages: 2,
                received_messages: 3,
                unread_messages: 2,
                recent_messages: 5,
            }
        );

        let future = db
            .message_stats(UserId(1), Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(future.recent_messages, 0);
        assert_eq!(
            db.message_stats(UserId(9), Utc::now()).unwrap(),
            MessageStats::default()
        );
    }

    #[test]
    fn conversation_stats_for_reader() {
        let (db, conv) = setup();
        let empty = db.conversation_stats(conv.id, UserId(1)).unwrap();
        assert_eq!(empty.total_messages, 0);
        assert!(empty.last_message.is_none());

        send(&db, &conv, 1, 2, "a");
        let last = send(&db, &conv, 1, 2, "b");

        let stats = db.conversation_stats(conv.id, UserId(2)).unwrap();
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.unread_messages, 2);
        assert_eq!(stats.last_message.map(|m| m.id), Some(last.id));
        assert_eq!(db.conversation_stats(conv.id, UserId(1)).unwrap().unread_messages, 0);

        assert!(matches!(
            db.conversation_stats(ConversationId(77), UserId(1)),
            Err(StoreError::NotFound)
        ));
    }
}
