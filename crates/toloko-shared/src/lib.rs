//! # toloko-shared
//!
//! Types shared by the store and the server: numeric identifiers, message
//! status, the JSON wire protocol spoken over the live socket, and the
//! default limits used by both sides.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use types::{AttachmentId, ConversationId, MessageId, MessageStatus, UserId};
