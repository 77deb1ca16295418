//! CRUD operations for [`Block`] records.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use toloko_shared::UserId;

use crate::database::{parse_timestamp, Database};
use crate::error::Result;
use crate::models::{Block, BlockStats};

const BLOCK_COLUMNS: &str = "id, blocker_id, blocked_id, created_at";

impl Database {
    /// Record that `blocker` blocks `blocked`. Returns `None` if that block
    /// already exists.
    pub fn insert_block(
        &self,
        blocker: UserId,
        blocked: UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<Block>> {
        let inserted = self.conn().execute(
            "INSERT INTO blocks (blocker_id, blocked_id, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(blocker_id, blocked_id) DO NOTHING",
            params![blocker.0, blocked.0, now.to_rfc3339()],
        )?;

        if inserted == 0 {
            return Ok(None);
        }

        Ok(Some(Block {
            id: self.conn().last_insert_rowid(),
            blocker_id: blocker,
            blocked_id: blocked,
            created_at: now,
        }))
    }

    pub fn delete_block(&self, blocker: UserId, blocked: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM blocks WHERE blocker_id = ?1 AND blocked_id = ?2",
            params![blocker.0, blocked.0],
        )?;
        Ok(affected > 0)
    }

    /// Whether `blocker` has blocked `blocked` (one direction only).
    pub fn is_blocked(&self, blocker: UserId, blocked: UserId) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM blocks WHERE blocker_id = ?1 AND blocked_id = ?2)",
            params![blocker.0, blocked.0],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Whether a block exists between the two users in either direction.
    pub fn is_blocked_either(&self, a: UserId, b: UserId) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM blocks
                 WHERE (blocker_id = ?1 AND blocked_id = ?2)
                    OR (blocker_id = ?2 AND blocked_id = ?1))",
            params![a.0, b.0],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// The block `blocker` placed on `blocked`, if any.
    pub fn get_block(&self, blocker: UserId, blocked: UserId) -> Result<Option<Block>> {
        let block = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {BLOCK_COLUMNS} FROM blocks WHERE blocker_id = ?1 AND blocked_id = ?2"
                ),
                params![blocker.0, blocked.0],
                row_to_block,
            )
            .optional()?;
        Ok(block)
    }

    /// Blocks created by `blocker`, newest first.
    pub fn list_blocks_by(&self, blocker: UserId) -> Result<Vec<Block>> {
        self.recent_blocks_by(blocker, u32::MAX)
    }

    /// How many users `user` has blocked and been blocked by, plus the
    /// `recent` newest blocks `user` created.
    pub fn block_stats(&self, user: UserId, recent: u32) -> Result<BlockStats> {
        let (blocked_count, blocked_by_count): (i64, i64) = self.conn().query_row(
            "SELECT
                 COALESCE(SUM(blocker_id = ?1), 0),
                 COALESCE(SUM(blocked_id = ?1), 0)
             FROM blocks
             WHERE blocker_id = ?1 OR blocked_id = ?1",
            params![user.0],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(BlockStats {
            blocked_count: blocked_count as u64,
            blocked_by_count: blocked_by_count as u64,
            recent_blocks: self.recent_blocks_by(user, recent)?,
        })
    }

    fn recent_blocks_by(&self, blocker: UserId, limit: u32) -> Result<Vec<Block>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks
             WHERE blocker_id = ?1
             ORDER BY id DESC
             LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![blocker.0, limit], row_to_block)?;

        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(row?);
        }
        Ok(blocks)
    }
}

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<Block> {
    let created_str: String = row.get(3)?;
    Ok(Block {
        id: row.get(0)?,
        blocker_id: UserId(row.get(1)?),
        blocked_id: UserId(row.get(2)?),
        created_at: parse_timestamp(3, &created_str)?,
    })
}
