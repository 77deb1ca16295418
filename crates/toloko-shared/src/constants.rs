/// Application name
pub const APP_NAME: &str = "Toloko";

/// Outbound events buffered per session before it counts as a slow consumer
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Largest inbound socket frame accepted, in bytes
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512;

/// Seconds without any inbound frame before a session is dropped
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

/// Seconds of outbound silence before a keepalive ping is written.
/// Must stay below the idle timeout so healthy peers answer in time.
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 54;

/// Upper bound on a single socket write, in seconds
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;

/// Maximum attachment size in bytes (10 MiB)
pub const MAX_ATTACHMENT_SIZE: usize = 10 * 1024 * 1024;

/// Media types accepted for message attachments
pub const ALLOWED_ATTACHMENT_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

/// File extensions accepted for message attachments
pub const ALLOWED_ATTACHMENT_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Page sizes for the history endpoints
pub const DEFAULT_CONVERSATION_PAGE: u32 = 20;
pub const DEFAULT_MESSAGE_PAGE: u32 = 50;
pub const MAX_PAGE: u32 = 100;
