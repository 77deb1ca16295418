//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be returned
//! directly from the REST layer.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use toloko_shared::{AttachmentId, ConversationId, MessageId, MessageStatus, UserId};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A pairwise conversation. There is at most one per unordered user pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    /// The user who initiated the conversation.
    pub user_a_id: UserId,
    pub user_b_id: UserId,
    /// Most recent message, if any. A cache, cleared when that message is
    /// deleted.
    pub last_message_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, user: UserId) -> bool {
        self.user_a_id == user || self.user_b_id == user
    }

    /// The participant that is not `user`, or `None` if `user` is not a
    /// participant at all.
    pub fn other_participant(&self, user: UserId) -> Option<UserId> {
        if self.user_a_id == user {
            Some(self.user_b_id)
        } else if self.user_b_id == user {
            Some(self.user_a_id)
        } else {
            None
        }
    }

    pub fn participants(&self) -> [UserId; 2] {
        [self.user_a_id, self.user_b_id]
    }
}

/// Order a user pair so that `(a, b)` and `(b, a)` map to the same key.
pub fn canonical_pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single direct message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub text: String,
    pub status: MessageStatus,
    /// Correlation token supplied by the sending client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to persist a new message. Status always starts at `sent`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub text: String,
    pub temp_id: Option<String>,
}

/// Message counters for one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MessageStats {
    pub total_messages: u64,
    pub sent_messages: u64,
    pub received_messages: u64,
    pub unread_messages: u64,
    /// Messages in the last 24 hours.
    pub recent_messages: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationStats {
    pub conversation_id: ConversationId,
    pub total_messages: u64,
    /// Unread messages addressed to the caller.
    pub unread_messages: u64,
    pub last_message_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
}

// ---------------------------------------------------------------------------
// Attachment
// ---------------------------------------------------------------------------

/// A file attached to a message. Removed together with the message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub id: AttachmentId,
    pub message_id: MessageId,
    /// Path of the stored file, relative to the upload directory.
    pub file_path: PathBuf,
    pub mime_type: String,
    pub size: u64,
    pub uploaded_by: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub message_id: MessageId,
    pub file_path: PathBuf,
    pub mime_type: String,
    pub size: u64,
    pub uploaded_by: UserId,
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// A directed block: `blocker_id` no longer wants contact with `blocked_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub id: i64,
    pub blocker_id: UserId,
    pub blocked_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockStats {
    /// Users the caller has blocked.
    pub blocked_count: u64,
    /// Users who have blocked the caller.
    pub blocked_by_count: u64,
    pub recent_blocks: Vec<Block>,
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Presence {
    pub user_id: UserId,
    pub is_online: bool,
    /// `None` for users that have never connected.
    pub last_seen: Option<DateTime<Utc>>,
}

impl Presence {
    /// The value reported for users with no presence row.
    pub fn offline(user_id: UserId) -> Self {
        Self {
            user_id,
            is_online: false,
            last_seen: None,
        }
    }
}
