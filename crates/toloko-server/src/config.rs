//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use toloko_shared::constants::{
    DEFAULT_HTTP_PORT, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_MAILBOX_CAPACITY,
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_PING_INTERVAL_SECS, DEFAULT_WRITE_TIMEOUT_SECS,
    MAX_ATTACHMENT_SIZE,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./toloko.db`
    pub database_path: PathBuf,

    /// Directory where attachment files are written.
    /// Env: `UPLOAD_DIR`
    /// Default: `./uploads/messages`
    pub upload_dir: PathBuf,

    /// HMAC secret shared with the account service that issues tokens.
    /// Env: `JWT_SECRET`
    pub jwt_secret: String,

    /// Maximum attachment size in bytes.
    /// Env: `MAX_UPLOAD_BYTES`
    /// Default: 10 MiB
    pub max_upload_size: usize,

    /// Per-connection limits for live sessions.
    pub session: SessionLimits,
}

/// Timing and buffer limits applied to every live session.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// Env: `MAILBOX_CAPACITY`
    pub mailbox_capacity: usize,
    /// Env: `MAX_FRAME_BYTES`
    pub max_frame_size: usize,
    /// Env: `IDLE_TIMEOUT_SECS`
    pub idle_timeout: Duration,
    /// Env: `PING_INTERVAL_SECS`
    pub ping_interval: Duration,
    /// Env: `WRITE_TIMEOUT_SECS`
    pub write_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./toloko.db"),
            upload_dir: PathBuf::from("./uploads/messages"),
            jwt_secret: "toloko-secret-key-change-in-production".to_string(),
            max_upload_size: MAX_ATTACHMENT_SIZE,
            session: SessionLimits::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            set_parsed(&mut config.http_addr, "HTTP_ADDR", &addr);
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(path) = lookup("UPLOAD_DIR") {
            config.upload_dir = PathBuf::from(path);
        }

        match lookup("JWT_SECRET") {
            Some(secret) if !secret.is_empty() => config.jwt_secret = secret,
            _ => tracing::warn!("JWT_SECRET not set, using the development secret"),
        }

        if let Some(val) = lookup("MAX_UPLOAD_BYTES") {
            set_parsed(&mut config.max_upload_size, "MAX_UPLOAD_BYTES", &val);
        }

        // -- Session limits --

        if let Some(val) = lookup("MAILBOX_CAPACITY") {
            set_parsed(&mut config.session.mailbox_capacity, "MAILBOX_CAPACITY", &val);
            // tokio's bounded channel panics on zero capacity.
            config.session.mailbox_capacity = config.session.mailbox_capacity.max(1);
        }

        if let Some(val) = lookup("MAX_FRAME_BYTES") {
            set_parsed(&mut config.session.max_frame_size, "MAX_FRAME_BYTES", &val);
        }

        if let Some(val) = lookup("IDLE_TIMEOUT_SECS") {
            set_secs(&mut config.session.idle_timeout, "IDLE_TIMEOUT_SECS", &val);
        }

        if let Some(val) = lookup("PING_INTERVAL_SECS") {
            set_secs(&mut config.session.ping_interval, "PING_INTERVAL_SECS", &val);
        }

        if let Some(val) = lookup("WRITE_TIMEOUT_SECS") {
            set_secs(&mut config.session.write_timeout, "WRITE_TIMEOUT_SECS", &val);
        }

        if config.session.ping_interval >= config.session.idle_timeout {
            tracing::warn!(
                ping = ?config.session.ping_interval,
                idle = ?config.session.idle_timeout,
                "Ping interval is not below the idle timeout; healthy peers may be dropped"
            );
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn set_parsed<T: FromStr>(slot: &mut T, key: &str, raw: &str) {
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => tracing::warn!(variable = key, value = %raw, "Invalid value, using default"),
    }
}

fn set_secs(slot: &mut Duration, key: &str, raw: &str) {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => *slot = Duration::from_secs(secs),
        _ => tracing::warn!(variable = key, value = %raw, "Invalid value, using default"),
    }
}
