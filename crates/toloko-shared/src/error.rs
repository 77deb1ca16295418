use thiserror::Error;

/// Errors raised while decoding frames or wire values.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The frame is not a JSON envelope with a string `type`.
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The envelope names an event type this server does not handle.
    #[error("Unknown event type: {0}")]
    UnknownType(String),

    /// The payload does not match the shape expected for its event type.
    #[error("Invalid payload for {kind}: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown message status: {0}")]
    UnknownStatus(String),
}

impl ProtocolError {
    /// Whether the read loop should give up on the connection.
    ///
    /// Only frames that are not an envelope at all are fatal; unknown types
    /// and bad payloads are dropped and the session keeps reading.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::Malformed(_))
    }
}
