//! # toloko-server
//!
//! Real-time direct messaging for the Toloko volunteer platform.
//!
//! - **Registry** ([`hub`]) owns every live socket session and all fan-out
//! - **Sessions** ([`session`]) run one read task and one write task per socket
//! - **Delivery** ([`delivery`]) persists messages and pushes the results
//! - **REST API** ([`api`]) exposes the same operations over HTTP

pub mod api;
pub mod attachment_store;
pub mod auth;
pub mod config;
pub mod db;
pub mod delivery;
pub mod error;
pub mod hub;
pub mod presence;
pub mod resolver;
pub mod session;
pub mod ws;

pub use api::{build_router, serve, AppState};
pub use config::{ServerConfig, SessionLimits};
pub use error::ServerError;
