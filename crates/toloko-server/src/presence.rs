//! Online/offline bookkeeping, one row per user.

use chrono::{DateTime, Utc};
use toloko_shared::UserId;
use toloko_store::Presence;

use crate::db::Db;
use crate::error::ServerError;

#[derive(Clone)]
pub struct PresenceTracker {
    db: Db,
}

impl PresenceTracker {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Mark `user` online. Returns the last-seen timestamp written.
    pub async fn set_online(&self, user: UserId) -> Result<DateTime<Utc>, ServerError> {
        self.set(user, true).await
    }

    /// Mark `user` offline with last-seen = now.
    pub async fn set_offline(&self, user: UserId) -> Result<DateTime<Utc>, ServerError> {
        self.set(user, false).await
    }

    /// Mark everyone offline. Only valid before any session is registered,
    /// e.g. after a restart that skipped the orderly shutdown.
    pub async fn reset_all(&self) -> Result<usize, ServerError> {
        let now = Utc::now();
        self.db.run(move |db| Ok(db.mark_all_offline(now)?)).await
    }

    pub async fn get(&self, user: UserId) -> Result<Presence, ServerError> {
        self.db.run(move |db| Ok(db.get_presence(user)?)).await
    }

    async fn set(&self, user: UserId, online: bool) -> Result<DateTime<Utc>, ServerError> {
        let now = Utc::now();
        self.db
            .run(move |db| Ok(db.upsert_presence(user, online, now)?))
            .await?;
        Ok(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toloko_store::Database;

    #[tokio::test]
    async fn test_online_then_offline() {
        let tracker = PresenceTracker::new(Db::new(Database::open_in_memory().unwrap()));

        assert_eq!(tracker.get(UserId(1)).await.unwrap(), Presence::offline(UserId(1)));

        tracker.set_online(UserId(1)).await.unwrap();
        assert!(tracker.get(UserId(1)).await.unwrap().is_online);

        let at = tracker.set_offline(UserId(1)).await.unwrap();
        let presence = tracker.get(UserId(1)).await.unwrap();
        assert!(!presence.is_online);
        assert_eq!(presence.last_seen, Some(at));
    }

    #[tokio::test]
    async fn test_reset_all_clears_stale_online_rows() {
        let tracker = PresenceTracker::new(Db::new(Database::open_in_memory().unwrap()));
        tracker.set_online(UserId(1)).await.unwrap();
        tracker.set_online(UserId(2)).await.unwrap();

        assert_eq!(tracker.reset_all().await.unwrap(), 2);
        assert!(!tracker.get(UserId(1)).await.unwrap().is_online);
        assert!(!tracker.get(UserId(2)).await.unwrap().is_online);
    }
}
