//! Canonical pairwise conversation lookup.

use chrono::{DateTime, Utc};
use toloko_shared::{ConversationId, UserId};
use toloko_store::{Conversation, Database};

use crate::db::Db;
use crate::error::{OrNotFound, ServerError};

#[derive(Clone)]
pub struct ConversationResolver {
    db: Db,
}

impl ConversationResolver {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Return the conversation for the unordered pair, creating it if it
    /// does not exist yet. Creation fails with [`ServerError::Blocked`] when
    /// either user has blocked the other.
    pub async fn get_or_create(&self, a: UserId, b: UserId) -> Result<Conversation, ServerError> {
        self.db
            .run(move |db| get_or_create_in(db, a, b, Utc::now()))
            .await
    }

    pub async fn participants(&self, id: ConversationId) -> Result<[UserId; 2], ServerError> {
        self.db
            .run(move |db| {
                db.get_conversation(id)
                    .or_not_found("Conversation")
                    .map(|c| c.participants())
            })
            .await
    }

    /// Fetch a conversation, hiding it from users who are not part of it.
    pub async fn get_for_participant(
        &self,
        id: ConversationId,
        user: UserId,
    ) -> Result<Conversation, ServerError> {
        self.db
            .run(move |db| {
                let conv = db.get_conversation(id).or_not_found("Conversation")?;
                if conv.has_participant(user) {
                    Ok(conv)
                } else {
                    Err(ServerError::NotFound("Conversation"))
                }
            })
            .await
    }

    pub async fn list_for_user(
        &self,
        user: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Conversation>, ServerError> {
        self.db
            .run(move |db| Ok(db.list_conversations_for_user(user, limit, offset)?))
            .await
    }
}

/// Resolve-or-create inside an already running database call.
pub(crate) fn get_or_create_in(
    db: &Database,
    a: UserId,
    b: UserId,
    now: DateTime<Utc>,
) -> Result<Conversation, ServerError> {
    if a == b {
        return Err(ServerError::BadRequest(
            "Cannot start a conversation with yourself".to_string(),
        ));
    }

    if let Some(existing) = db.find_conversation_between(a, b)? {
        return Ok(existing);
    }

    if db.is_blocked_either(a, b)? {
        return Err(ServerError::Blocked);
    }

    Ok(db.insert_conversation_if_absent(a, b, now)?)
}
