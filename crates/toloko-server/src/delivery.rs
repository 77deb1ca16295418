//! Message delivery: persistence, status changes and the resulting pushes.

use chrono::Utc;
use tracing::{debug, warn};

use toloko_shared::protocol::{ReceivedMessage, ServerEvent};
use toloko_shared::{ConversationId, MessageId, MessageStatus, UserId};
use toloko_store::{Message, NewMessage};

use crate::db::Db;
use crate::error::{OrNotFound, ServerError};
use crate::hub::Registry;
use crate::resolver::{self, ConversationResolver};

#[derive(Clone)]
pub struct MessageDelivery {
    db: Db,
    registry: Registry,
    resolver: ConversationResolver,
}

impl MessageDelivery {
    pub fn new(db: Db, registry: Registry, resolver: ConversationResolver) -> Self {
        Self {
            db,
            registry,
            resolver,
        }
    }

    /// Persist a message from `from` to `to` and push it to both sides.
    ///
    /// The block check, conversation resolution, insert and last-message
    /// update happen in one database call. The sender's sessions get
    /// `message.deliver`; the recipient's sessions get `message.receive`, and
    /// if any of them accepted it the message moves to `delivered`.
    pub async fn send_message(
        &self,
        from: UserId,
        to: UserId,
        text: String,
        temp_id: Option<String>,
    ) -> Result<Message, ServerError> {
        if from == to {
            return Err(ServerError::BadRequest(
                "Cannot send a message to yourself".to_string(),
            ));
        }
        if text.trim().is_empty() {
            return Err(ServerError::BadRequest("Message text is required".to_string()));
        }

        let mut message = self
            .db
            .run(move |db| {
                if db.is_blocked_either(from, to)? {
                    return Err(ServerError::Blocked);
                }

                let now = Utc::now();
                let conversation = resolver::get_or_create_in(db, from, to, now)?;
                let message = db.insert_message(
                    &NewMessage {
                        conversation_id: conversation.id,
                        from_user_id: from,
                        to_user_id: to,
                        text,
                        temp_id,
                    },
                    now,
                )?;
                Ok(message)
            })
            .await?;

        debug!(
            message = %message.id,
            conversation = %message.conversation_id,
            from = %from,
            to = %to,
            "message stored"
        );

        self.registry
            .send_to_user(
                from,
                ServerEvent::MessageDeliver {
                    message_id: message.id,
                    temp_id: message.temp_id.clone(),
                },
            )
            .await;

        let reached = self
            .registry
            .send_to_user(to, ServerEvent::MessageReceive(received(&message)))
            .await;

        if reached > 0 {
            let id = message.id;
            let advanced = self
                .db
                .run(move |db| {
                    Ok(db.advance_message_status(id, MessageStatus::Delivered, Utc::now())?)
                })
                .await;
            match advanced {
                Ok(true) => message.status = MessageStatus::Delivered,
                Ok(false) => {}
                Err(e) => warn!(message = %id, error = %e, "failed to mark message delivered"),
            }
        }

        Ok(message)
    }

    /// Mark a message as read by its recipient.
    ///
    /// Returns `true` on a real transition, in which case the sender's
    /// sessions receive `message.read`. Re-marking is a no-op.
    pub async fn mark_read(&self, id: MessageId, reader: UserId) -> Result<bool, ServerError> {
        let (changed, sender) = self
            .db
            .run(move |db| {
                let message = db.get_message(id).or_not_found("Message")?;
                if message.to_user_id != reader {
                    return Err(ServerError::Forbidden(
                        "Only the recipient can mark a message as read".to_string(),
                    ));
                }
                let changed = db.advance_message_status(id, MessageStatus::Read, Utc::now())?;
                Ok((changed, message.from_user_id))
            })
            .await?;

        if changed {
            self.registry
                .send_to_user(sender, ServerEvent::MessageRead { message_id: id })
                .await;
        }

        Ok(changed)
    }

    /// Mark every unread message addressed to `reader` in the conversation as
    /// read, notifying each sender. Returns how many messages changed.
    pub async fn mark_conversation_read(
        &self,
        conversation: ConversationId,
        reader: UserId,
    ) -> Result<usize, ServerError> {
        let transitioned = self
            .db
            .run(move |db| {
                let conv = db.get_conversation(conversation).or_not_found("Conversation")?;
                if !conv.has_participant(reader) {
                    return Err(ServerError::NotFound("Conversation"));
                }
                Ok(db.mark_conversation_read(conversation, reader, Utc::now())?)
            })
            .await?;

        for (message_id, sender) in &transitioned {
            let event = ServerEvent::MessageRead {
                message_id: *message_id,
            };
            self.registry.send_to_user(*sender, event).await;
        }

        Ok(transitioned.len())
    }

    /// Relay a typing indicator to the other participant.
    pub async fn relay_typing(
        &self,
        user: UserId,
        conversation: ConversationId,
        started: bool,
    ) -> Result<(), ServerError> {
        self.resolver.get_for_participant(conversation, user).await?;

        let event = if started {
            ServerEvent::TypingStart {
                user_id: user,
                conversation_id: conversation,
            }
        } else {
            ServerEvent::TypingStop {
                user_id: user,
                conversation_id: conversation,
            }
        };

        self.registry
            .send_to_conversation(conversation, event, Some(user))
            .await?;
        Ok(())
    }
}

fn received(message: &Message) -> ReceivedMessage {
    ReceivedMessage {
        id: message.id,
        conversation_id: message.conversation_id,
        from_user_id: message.from_user_id,
        text: message.text.clone(),
        status: message.status,
        created_at: message.created_at,
    }
}
