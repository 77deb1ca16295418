//! JSON frames exchanged over the live socket.
//!
//! Every frame, in both directions, is an envelope of the form
//! `{ "type": <string>, "payload": <object>, "temp_id"?: <string> }`.
//! Inbound frames are decoded once into [`ClientFrame`]; handlers never see
//! raw JSON. Outbound frames are [`ServerEvent`] values.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{ConversationId, MessageId, MessageStatus, UserId};

pub const MESSAGE_SEND: &str = "message.send";
pub const MESSAGE_READ: &str = "message.read";
pub const TYPING_START: &str = "typing.start";
pub const TYPING_STOP: &str = "typing.stop";
pub const PING: &str = "ping";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    temp_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Client -> Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    pub text: String,
    pub to_user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkRead {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingTarget {
    pub conversation_id: ConversationId,
}

/// Every event a client may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    SendMessage(SendMessage),
    MarkRead(MarkRead),
    TypingStart(TypingTarget),
    TypingStop(TypingTarget),
    Ping,
}

impl ClientEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendMessage(_) => MESSAGE_SEND,
            Self::MarkRead(_) => MESSAGE_READ,
            Self::TypingStart(_) => TYPING_START,
            Self::TypingStop(_) => TYPING_STOP,
            Self::Ping => PING,
        }
    }
}

/// A validated inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFrame {
    pub event: ClientEvent,
    /// Client correlation token, echoed back in `message.deliver`.
    pub temp_id: Option<String>,
}

impl ClientFrame {
    /// Decode and validate a raw frame.
    pub fn decode(raw: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_slice(raw)?;
        let Envelope {
            kind,
            payload,
            temp_id,
        } = envelope;

        let event = match kind.as_str() {
            MESSAGE_SEND => ClientEvent::SendMessage(parse_payload(&kind, payload)?),
            MESSAGE_READ => ClientEvent::MarkRead(parse_payload(&kind, payload)?),
            TYPING_START => ClientEvent::TypingStart(parse_payload(&kind, payload)?),
            TYPING_STOP => ClientEvent::TypingStop(parse_payload(&kind, payload)?),
            PING => ClientEvent::Ping,
            _ => return Err(ProtocolError::UnknownType(kind)),
        };

        Ok(Self { event, temp_id })
    }
}

fn parse_payload<T: DeserializeOwned>(
    kind: &str,
    payload: serde_json::Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Server -> Client
// ---------------------------------------------------------------------------

/// Full message body carried by `message.receive`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub from_user_id: UserId,
    pub text: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

/// Every event the server pushes to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "message.deliver")]
    MessageDeliver {
        message_id: MessageId,
        temp_id: Option<String>,
    },

    #[serde(rename = "message.receive")]
    MessageReceive(ReceivedMessage),

    #[serde(rename = "message.read")]
    MessageRead { message_id: MessageId },

    #[serde(rename = "typing.start")]
    TypingStart {
        user_id: UserId,
        conversation_id: ConversationId,
    },

    #[serde(rename = "typing.stop")]
    TypingStop {
        user_id: UserId,
        conversation_id: ConversationId,
    },

    #[serde(rename = "presence.update")]
    PresenceUpdate {
        user_id: UserId,
        is_online: bool,
        last_seen: DateTime<Utc>,
    },

    #[serde(rename = "pong")]
    Pong { timestamp: i64 },
}

impl ServerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageDeliver { .. } => "message.deliver",
            Self::MessageReceive(_) => "message.receive",
            Self::MessageRead { .. } => MESSAGE_READ,
            Self::TypingStart { .. } => TYPING_START,
            Self::TypingStop { .. } => TYPING_STOP,
            Self::PresenceUpdate { .. } => "presence.update",
            Self::Pong { .. } => "pong",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_message_send_with_temp_id() {
        let raw = br#"{"type":"message.send","payload":{"text":"Hello","to_user_id":2},"temp_id":"abc"}"#;
        let frame = ClientFrame::decode(raw).unwrap();

        assert_eq!(frame.temp_id.as_deref(), Some("abc"));
        assert_eq!(
            frame.event,
            ClientEvent::SendMessage(SendMessage {
                text: "Hello".into(),
                to_user_id: UserId(2),
            })
        );
    }

    #[test]
    fn test_decode_ping_without_payload() {
        let frame = ClientFrame::decode(br#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame.event, ClientEvent::Ping);
        assert!(frame.temp_id.is_none());
    }

    #[test]
    fn test_unknown_type_is_not_fatal() {
        let err = ClientFrame::decode(br#"{"type":"call.start","payload":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(ref t) if t == "call.start"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_bad_payload_is_not_fatal() {
        let err =
            ClientFrame::decode(br#"{"type":"message.read","payload":{"message_id":"x"}}"#)
                .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_non_envelope_is_fatal() {
        assert!(ClientFrame::decode(b"not json").unwrap_err().is_fatal());
        assert!(ClientFrame::decode(br#"{"payload":{}}"#).unwrap_err().is_fatal());
    }

    #[test]
    fn test_decode_typing_keeps_temp_id() {
        let raw = serde_json::to_vec(&Envelope {
            kind: TYPING_START.to_string(),
            payload: serde_json::json!({ "conversation_id": 9 }),
            temp_id: Some("t-1".into()),
        })
        .unwrap();

        let frame = ClientFrame::decode(&raw).unwrap();
        assert_eq!(
            frame,
            ClientFrame {
                event: ClientEvent::TypingStart(TypingTarget {
                    conversation_id: ConversationId(9),
                }),
                temp_id: Some("t-1".into()),
            }
        );
    }

    #[test]
    fn test_server_event_envelope_shape() {
        let event = ServerEvent::MessageDeliver {
            message_id: MessageId(5),
            temp_id: Some("abc".into()),
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "message.deliver");
        assert_eq!(value["payload"]["message_id"], 5);
        assert_eq!(value["payload"]["temp_id"], "abc");
    }

    #[test]
    fn test_receive_payload_fields() {
        let event = ServerEvent::MessageReceive(ReceivedMessage {
            id: MessageId(1),
            conversation_id: ConversationId(3),
            from_user_id: UserId(1),
            text: "Hello".into(),
            status: MessageStatus::Sent,
            created_at: Utc::now(),
        });
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "message.receive");
        assert_eq!(value["payload"]["status"], "sent");
        assert_eq!(value["payload"]["conversation_id"], 3);
        assert!(value["payload"]["created_at"].is_string());
    }
}
