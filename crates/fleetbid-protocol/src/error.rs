use thiserror::Error;

/// Errors raised while decoding or interpreting wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed JSON ({discarded} bytes discarded): {source}")]
    Malformed {
        discarded: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("message type '{0}' is not recognised")]
    UnknownType(String),

    #[error("'{kind}' message is missing required field '{field}'")]
    MissingField { kind: &'static str, field: &'static str },

    #[error("'{kind}' message has invalid field '{field}': {reason}")]
    InvalidField {
        kind: &'static str,
        field: &'static str,
        reason: String,
    },

    #[error("buffered {buffered} bytes without a complete message (limit {limit})")]
    FrameTooLarge { buffered: usize, limit: usize },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ProtocolError {
    /// Whether the connection can keep going after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ProtocolError::FrameTooLarge { .. })
    }
}
