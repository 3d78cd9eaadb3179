//! Protocol error types.

use thiserror::Error;

/// Errors raised while framing, parsing or reassembling packets.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("header checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    HeaderChecksumMismatch { expected: u16, actual: u16 },

    #[error("payload checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("incomplete frame: need {needed} more bytes")]
    IncompleteFrame { needed: usize },

    #[error("malformed byte-stuffed payload: {0}")]
    MalformedPayload(&'static str),

    #[error("invalid frame flags: {0:#04x}")]
    InvalidFlags(u8),

    #[error("encryption tag {0} out of range (max 3)")]
    InvalidEncryptionTag(u8),

    #[error("unsupported compression mode: {0}")]
    UnsupportedCompression(u8),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("chunk [{offset}, {end}) invalid for message of {total} bytes: {reason}")]
    ChunkOverflow {
        offset: u32,
        end: u64,
        total: u32,
        reason: &'static str,
    },

    #[error("decompression failed")]
    DecompressionFailed,

    #[error("decompressed length mismatch: declared {declared}, got {actual}")]
    DecompressionLengthMismatch { declared: usize, actual: usize },

    #[error("buffer pool exhausted: requested {requested} bytes ({outstanding} outstanding)")]
    PoolExhausted { requested: usize, outstanding: usize },

    #[error("invalid ring buffer capacity: {0}")]
    InvalidCapacity(usize),

    #[error("request id 0 is reserved for uncorrelated frames")]
    ReservedRequestId,
}

impl ProtocolError {
    /// Returns whether a stream reader can recover by dropping the offending
    /// frame or message and scanning on, instead of giving up on the stream.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::HeaderChecksumMismatch { .. }
                | ProtocolError::ChecksumMismatch { .. }
                | ProtocolError::MalformedPayload(_)
                | ProtocolError::InvalidFlags(_)
                | ProtocolError::UnsupportedCompression(_)
                | ProtocolError::ChunkOverflow { .. }
                | ProtocolError::DecompressionFailed
                | ProtocolError::DecompressionLengthMismatch { .. }
                | ProtocolError::MessageTooLarge { .. }
                | ProtocolError::ReservedRequestId
        )
    }
}
