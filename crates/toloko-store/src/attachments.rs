//! CRUD operations for [`Attachment`] records.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::params;
use toloko_shared::{AttachmentId, MessageId, UserId};

use crate::database::{parse_timestamp, Database};
use crate::error::{Result, StoreError};
use crate::models::{Attachment, NewAttachment};

impl Database {
    pub fn insert_attachment(&self, new: &NewAttachment, now: DateTime<Utc>) -> Result<Attachment> {
        self.conn().execute(
            "INSERT INTO attachments (message_id, file_path, mime_type, size, uploaded_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new.message_id.0,
                new.file_path.to_string_lossy(),
                new.mime_type,
                new.size as i64,
                new.uploaded_by.0,
                now.to_rfc3339(),
            ],
        )?;

        Ok(Attachment {
            id: AttachmentId(self.conn().last_insert_rowid()),
            message_id: new.message_id,
            file_path: new.file_path.clone(),
            mime_type: new.mime_type.clone(),
            size: new.size,
            uploaded_by: new.uploaded_by,
            created_at: now,
        })
    }

    pub fn get_attachment(&self, id: AttachmentId) -> Result<Attachment> {
        self.conn()
            .query_row(
                "SELECT id, message_id, file_path, mime_type, size, uploaded_by, created_at
                 FROM attachments WHERE id = ?1",
                params![id.0],
                row_to_attachment,
            )
            .map_err(StoreError::from_query)
    }

    /// Attachments of a message, oldest first.
    pub fn list_attachments_for_message(&self, message: MessageId) -> Result<Vec<Attachment>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, message_id, file_path, mime_type, size, uploaded_by, created_at
             FROM attachments
             WHERE message_id = ?1
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![message.0], row_to_attachment)?;

        let mut attachments = Vec::new();
        for row in rows {
            attachments.push(row?);
        }
        Ok(attachments)
    }

    pub fn delete_attachment(&self, id: AttachmentId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM attachments WHERE id = ?1", params![id.0])?;
        Ok(affected > 0)
    }
}

fn row_to_attachment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Attachment> {
    let path_str: String = row.get(2)?;
    let size: i64 = row.get(4)?;
    let created_str: String = row.get(6)?;

    Ok(Attachment {
        id: AttachmentId(row.get(0)?),
        message_id: MessageId(row.get(1)?),
        file_path: PathBuf::from(path_str),
        mime_type: row.get(3)?,
        size: size.max(0) as u64,
        uploaded_by: UserId(row.get(5)?),
        created_at: parse_timestamp(6, &created_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMessage;

    #[test]
    fn attachments_follow_their_message() {
        let db = Database::open_in_memory().unwrap();
        let conv = db
            .insert_conversation_if_absent(UserId(1), UserId(2), Utc::now())
            .unwrap();
        let msg = db
            .insert_message(
                &NewMessage {
                    conversation_id: conv.id,
                    from_user_id: UserId(1),
                    to_user_id: UserId(2),
                    text: "see photo".into(),
                    temp_id: None,
                },
                Utc::now(),
            )
            .unwrap();

        let att = db
            .insert_attachment(
                &NewAttachment {
                    message_id: msg.id,
                    file_path: PathBuf::from("1/abc.png"),
                    mime_type: "image/png".into(),
                    size: 2048,
                    uploaded_by: UserId(1),
                },
                Utc::now(),
            )
            .unwrap();

        assert_eq!(db.get_attachment(att.id).unwrap().size, 2048);
        assert_eq!(db.get_message(msg.id).unwrap().attachments, vec![att.clone()]);

        db.delete_message(msg.id).unwrap();
        assert!(matches!(db.get_attachment(att.id), Err(StoreError::NotFound)));
    }

    #[test]
    fn attachment_requires_message() {
        let db = Database::open_in_memory().unwrap();
        let result = db.insert_attachment(
            &NewAttachment {
                message_id: MessageId(77),
                file_path: PathBuf::from("x.png"),
                mime_type: "image/png".into(),
                size: 1,
                uploaded_by: UserId(1),
            },
            Utc::now(),
        );
        assert!(result.is_err());
    }
}
