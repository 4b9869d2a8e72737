//! Error types for the iSCSI initiator receive engine

use thiserror::Error;

/// Receive-engine errors
///
/// `Transport`, `Protocol` and `ExcessiveLoss` are fatal to the connection;
/// `Frame` triggers stream resynchronization and is only fatal when repeated.
#[derive(Debug, Error)]
pub enum IscsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport failed: {0}")]
    Transport(String),

    /// Blocking read expired without receiving a single byte. Only raised
    /// between PDUs; mid-frame stalls surface as `Transport`.
    #[error("idle timeout expired")]
    IdleTimeout,

    #[error("frame error: {0}")]
    Frame(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("data segment truncated: expected at most {limit} bytes, got {got}")]
    Truncated { limit: usize, got: usize },

    /// A sequence gap that the session's recovery level does not permit
    /// bridging via SNACK
    #[error("unrecoverable sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u32, got: u32 },

    #[error("too many out-of-order PDUs outstanding")]
    ExcessiveLoss,

    #[error("session error: {0}")]
    Session(String),
}

impl IscsiError {
    /// Whether this error must terminate the connection's receive loop.
    /// Frame-level errors are recoverable via resynchronization.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, IscsiError::Frame(_))
    }
}

/// Result type for receive-engine operations
pub type IscsiResult<T> = Result<T, IscsiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_errors_are_recoverable() {
        assert!(!IscsiError::Frame("bad header digest".to_string()).is_connection_fatal());
        assert!(IscsiError::Transport("closed".to_string()).is_connection_fatal());
        assert!(IscsiError::ExcessiveLoss.is_connection_fatal());
        assert!(IscsiError::Truncated { limit: 8192, got: 70000 }.is_connection_fatal());
    }
}
