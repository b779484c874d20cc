use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message too large: {0} bytes (max 15996)")]
    MessageTooLarge(usize),

    #[error("stream closed mid-frame with {0} bytes buffered")]
    TruncatedFrame(usize),

    #[error("missing field `{field}` for action `{action}`")]
    MissingField { action: String, field: &'static str },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
