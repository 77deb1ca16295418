//! Presence rows: one per user, upserted on connect and disconnect.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use toloko_shared::UserId;

use crate::database::{parse_timestamp, Database};
use crate::error::Result;
use crate::models::Presence;

impl Database {
    /// Set the online flag for `user` and refresh last-seen to `at`.
    pub fn upsert_presence(&self, user: UserId, is_online: bool, at: DateTime<Utc>) -> Result<()> {
        let ts = at.to_rfc3339();
        self.conn().execute(
            "INSERT INTO presence (user_id, is_online, last_seen_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                 is_online = excluded.is_online,
                 last_seen_at = excluded.last_seen_at,
                 updated_at = excluded.updated_at",
            params![user.0, is_online, ts],
        )?;
        Ok(())
    }

    /// Flip every online row to offline with last-seen `at`. Returns how
    /// many users were affected. Used at startup, when no session can be
    /// live.
    pub fn mark_all_offline(&self, at: DateTime<Utc>) -> Result<usize> {
        let ts = at.to_rfc3339();
        let affected = self.conn().execute(
            "UPDATE presence SET is_online = 0, last_seen_at = ?1, updated_at = ?1
             WHERE is_online = 1",
            params![ts],
        )?;
        Ok(affected)
    }

    /// Presence for `user`, or the offline default if the user never
    /// connected.
    pub fn get_presence(&self, user: UserId) -> Result<Presence> {
        let row = self
            .conn()
            .query_row(
                "SELECT is_online, last_seen_at FROM presence WHERE user_id = ?1",
                params![user.0],
                |row| {
                    let is_online: bool = row.get(0)?;
                    let last_seen = match row.get::<_, Option<String>>(1)? {
                        Some(raw) => Some(parse_timestamp(1, &raw)?),
                        None => None,
                    };
                    Ok((is_online, last_seen))
                },
            )
            .optional()?;

        Ok(match row {
            Some((is_online, last_seen)) => Presence {
                user_id: user,
                is_online,
                last_seen,
            },
            None => Presence::offline(user),
        })
    }
}
