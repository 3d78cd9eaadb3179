//! Session error types.

use crate::ConnectionKey;
use thiserror::Error;

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] tidewire_protocol::ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("pending request table full ({0} requests in flight)")]
    TableFull(usize),

    #[error("transport error on {conn}: {message}")]
    Transport {
        conn: ConnectionKey,
        message: String,
    },

    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionKey),
}

impl SessionError {
    /// Returns whether the failed operation may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::TableFull(_) => true,
            SessionError::Transport { .. } => true,
            SessionError::Protocol(e) => matches!(
                e,
                tidewire_protocol::ProtocolError::PoolExhausted { .. }
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidewire_protocol::ProtocolError;

    #[test]
    fn test_retryable() {
        assert!(SessionError::TableFull(65535).is_retryable());
        assert!(SessionError::from(ProtocolError::PoolExhausted {
            requested: 1,
            outstanding: 8
        })
        .is_retryable());
        assert!(!SessionError::from(ProtocolError::ReservedRequestId).is_retryable());
        assert!(!SessionError::ConnectionClosed(ConnectionKey(1)).is_retryable());
    }

    #[test]
    fn test_display_names_connection() {
        let err = SessionError::Transport {
            conn: ConnectionKey(9),
            message: "broken pipe".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("conn-9"));
        assert!(msg.contains("broken pipe"));
    }
}
