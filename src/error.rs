// MIT License - Copyright (c) 2026 Peter Wright

/// All errors that can occur in the bridge.
///
/// Protocol-layer errors (`Crc`, `Decrypt`, `MalformedFrame`,
/// `AccountMismatch`, `StaleTimestamp`) are recovered per frame: the
/// offending frame gets a NAK and the connection carries on. Dispatch
/// errors are surfaced per camera and never reach the protocol layer.
/// Only `Config` is fatal, and only at startup.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CRC mismatch (expected {expected}, got {received})")]
    Crc { expected: String, received: String },

    #[error("decryption failed: {details}")]
    Decrypt { details: String },

    #[error("malformed frame: {details}")]
    MalformedFrame { details: String },

    #[error("account mismatch: frame carries {received}")]
    AccountMismatch { received: String },

    #[error("event timestamp outside accepted window ({skew_secs}s skew)")]
    StaleTimestamp { skew_secs: i64 },

    #[error("unsupported message type: {message_type}")]
    UnsupportedMessageType { message_type: String },

    #[error("credential error: {details}")]
    Credential { details: String },

    #[error("transient dispatch failure: {details}")]
    TransientDispatch { details: String },

    #[error("dispatch rejected: {details}")]
    PermanentDispatch { details: String },

    #[error("configuration error: {details}")]
    Config { details: String },
}

impl BridgeError {
    /// Whether this error is transient and the operation should be retried
    /// with backoff. Credential errors are excluded: they get exactly one
    /// token refresh instead of the backoff loop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::Io(_) | BridgeError::TransientDispatch { .. }
        )
    }

    pub(crate) fn config(details: impl Into<String>) -> Self {
        BridgeError::Config { details: details.into() }
    }

    pub(crate) fn malformed(details: impl Into<String>) -> Self {
        BridgeError::MalformedFrame { details: details.into() }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
