//! # tidewire-protocol
//!
//! Wire format for tidewire packet streams.
//!
//! This crate provides:
//! - A fixed 7-byte frame header with a folded CRC32C checksum
//! - Byte-stuffed payloads terminated by `0x00` for stream resynchronization
//! - Optional LZ4 compression and chunking of large messages
//! - A power-of-two ring buffer and a pooled buffer allocator

pub mod codec;
pub mod compression;
pub mod error;
pub mod frame;
pub mod packet;
pub mod payload;
pub mod pool;
pub mod ring;

pub use codec::{
    CodecConfig, DecoderStats, Frame, FrameDecoder, FrameEncoder, OutboundMessage, ParseOutcome,
    DEFAULT_DECODER_CAPACITY, MAX_FRAME_BODY, MIN_DECODER_CAPACITY,
};
pub use error::ProtocolError;
pub use frame::{ChunkInfo, CompressionMode, EncryptionMode, FrameFlags, FrameHeader, HEADER_SIZE};
pub use packet::{Packet, Route};
pub use payload::{PayloadChecksum, PayloadCodec, TERMINATOR};
pub use pool::{BufferPool, PoolConfig, PoolStats, PooledBuf};
pub use ring::RingBuffer;

/// Maximum reassembled message size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
