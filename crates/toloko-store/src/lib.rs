//! # toloko-store
//!
//! SQLite persistence for the messaging core. The crate exposes a
//! synchronous [`Database`] handle that wraps a `rusqlite::Connection` and
//! provides typed helpers for conversations, messages, attachments, blocks
//! and presence. Callers that live on an async runtime are expected to move
//! calls onto a blocking thread.

pub mod attachments;
pub mod blocks;
pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod presence;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
