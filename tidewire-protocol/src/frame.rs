//! Fixed frame header and flag bits.
//!
//! Header layout (7 bytes, big-endian):
//!
//! ```text
//! +--------+---------------------+-----------+-----------------+
//! | flags  | command/response id | data_len  | header checksum |
//! | 1 byte | 2 bytes             | 2 bytes   | 2 bytes         |
//! +--------+---------------------+-----------+-----------------+
//! | payload region: COBS(meta | body | crc32c) 0x00             |
//! | data_len bytes                                              |
//! +-------------------------------------------------------------+
//! ```
//!
//! Flags byte:
//!
//! ```text
//! bit 0     response
//! bit 1     request
//! bit 2     chunked
//! bits 3-4  compression mode
//! bits 5-6  encryption mode tag
//! bit 7     reserved, must be zero
//! ```
//!
//! `meta` is `[u16 request_id]` when the request or response bit is set,
//! followed by `[u32 packet_id, u32 chunk_offset, u32 total_len]` when the
//! chunked bit is set.

use crate::error::ProtocolError;
use crate::payload::header_checksum;
use bytes::{Buf, BufMut};

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 7;

/// Size of the request/response correlation id block.
pub const REQUEST_META_SIZE: usize = 2;

/// Size of the chunk metadata block.
pub const CHUNK_META_SIZE: usize = 12;

/// Compression applied to a message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionMode {
    #[default]
    None = 0,
    Lz4 = 1,
}

impl TryFrom<u8> for CompressionMode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompressionMode::None),
            1 => Ok(CompressionMode::Lz4),
            other => Err(ProtocolError::UnsupportedCompression(other)),
        }
    }
}

/// Opaque encryption tag carried in the flags byte. Payload encryption itself
/// happens outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct EncryptionMode(u8);

impl EncryptionMode {
    pub const NONE: EncryptionMode = EncryptionMode(0);

    /// Creates a tag; only the low two bits are representable on the wire.
    pub fn new(tag: u8) -> Result<Self, ProtocolError> {
        if tag > 3 {
            return Err(ProtocolError::InvalidEncryptionTag(tag));
        }
        Ok(Self(tag))
    }

    pub fn tag(&self) -> u8 {
        self.0
    }
}

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Frame carries a response; the id field is the correlation id.
    pub const RESPONSE: u8 = 1 << 0;
    /// Frame expects a response; a request id follows in the payload region.
    pub const REQUEST: u8 = 1 << 1;
    /// Frame is one chunk of a larger message.
    pub const CHUNKED: u8 = 1 << 2;

    const COMPRESSION_SHIFT: u8 = 3;
    const COMPRESSION_MASK: u8 = 0b11 << Self::COMPRESSION_SHIFT;
    const ENCRYPTION_SHIFT: u8 = 5;
    const ENCRYPTION_MASK: u8 = 0b11 << Self::ENCRYPTION_SHIFT;
    const RESERVED_MASK: u8 = 1 << 7;

    pub fn new() -> Self {
        Self(0)
    }

    /// Wraps raw bits without validation.
    pub fn from_raw(bits: u8) -> Self {
        Self(bits)
    }

    /// Wraps raw bits, rejecting reserved bits and unknown compression modes.
    pub fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        let flags = Self(bits);
        flags.validate()?;
        Ok(flags)
    }

    /// Checks reserved bits and the compression mode field.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.0 & Self::RESERVED_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(self.0));
        }
        if self.is_response() && self.is_request() {
            return Err(ProtocolError::InvalidFlags(self.0));
        }
        self.compression()?;
        Ok(())
    }

    pub fn with_response(mut self) -> Self {
        self.0 |= Self::RESPONSE;
        self
    }

    pub fn with_request(mut self) -> Self {
        self.0 |= Self::REQUEST;
        self
    }

    pub fn with_chunked(mut self) -> Self {
        self.0 |= Self::CHUNKED;
        self
    }

    pub fn with_compression(mut self, mode: CompressionMode) -> Self {
        self.0 = (self.0 & !Self::COMPRESSION_MASK) | ((mode as u8) << Self::COMPRESSION_SHIFT);
        self
    }

    pub fn with_encryption(mut self, mode: EncryptionMode) -> Self {
        self.0 = (self.0 & !Self::ENCRYPTION_MASK) | (mode.tag() << Self::ENCRYPTION_SHIFT);
        self
    }

    pub fn is_response(&self) -> bool {
        self.0 & Self::RESPONSE != 0
    }

    pub fn is_request(&self) -> bool {
        self.0 & Self::REQUEST != 0
    }

    pub fn is_chunked(&self) -> bool {
        self.0 & Self::CHUNKED != 0
    }

    /// Whether a request id block precedes the body.
    pub fn has_request_id(&self) -> bool {
        self.is_request() || self.is_response()
    }

    pub fn compression(&self) -> Result<CompressionMode, ProtocolError> {
        CompressionMode::try_from((self.0 & Self::COMPRESSION_MASK) >> Self::COMPRESSION_SHIFT)
    }

    pub fn encryption(&self) -> EncryptionMode {
        EncryptionMode((self.0 & Self::ENCRYPTION_MASK) >> Self::ENCRYPTION_SHIFT)
    }

    /// Size of the metadata blocks selected by these flags.
    pub fn meta_len(&self) -> usize {
        let mut len = 0;
        if self.has_request_id() {
            len += REQUEST_META_SIZE;
        }
        if self.is_chunked() {
            len += CHUNK_META_SIZE;
        }
        len
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// The fixed header preceding every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub flags: FrameFlags,
    /// Command id, or the correlation id when the response bit is set.
    pub id: u16,
    /// Length of the payload region including the terminator.
    pub data_len: u16,
    pub checksum: u16,
}

impl FrameHeader {
    /// Builds a header and computes its checksum.
    pub fn new(flags: FrameFlags, id: u16, data_len: u16) -> Self {
        let mut header = Self {
            flags,
            id,
            data_len,
            checksum: 0,
        };
        header.checksum = header.compute_checksum();
        header
    }

    fn checksummed_bytes(&self) -> [u8; HEADER_SIZE - 2] {
        let id = self.id.to_be_bytes();
        let len = self.data_len.to_be_bytes();
        [self.flags.bits(), id[0], id[1], len[0], len[1]]
    }

    pub fn compute_checksum(&self) -> u16 {
        header_checksum(&self.checksummed_bytes())
    }

    /// Validates the checksum and the flags.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        let actual = self.compute_checksum();
        if actual != self.checksum {
            return Err(ProtocolError::HeaderChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        self.flags.validate()
    }

    /// Total on-wire size of the frame this header describes.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.data_len as usize
    }

    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.id);
        buf.put_u16(self.data_len);
        buf.put_u16(self.checksum);
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        self.put(&mut &mut out[..]);
        out
    }

    /// Parses a header from the front of `buf` without validating it.
    pub fn parse(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            flags: FrameFlags::from_raw(buf.get_u8()),
            id: buf.get_u16(),
            data_len: buf.get_u16(),
            checksum: buf.get_u16(),
        })
    }
}

/// Position of one chunk inside a larger message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Sender-scoped id shared by every chunk of one message. Never zero.
    pub packet_id: u32,
    pub offset: u32,
    /// Length of the whole (possibly compressed) message.
    pub total_len: u32,
}

impl ChunkInfo {
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.packet_id);
        buf.put_u32(self.offset);
        buf.put_u32(self.total_len);
    }

    pub fn parse(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < CHUNK_META_SIZE {
            return None;
        }
        Some(Self {
            packet_id: buf.get_u32(),
            offset: buf.get_u32(),
            total_len: buf.get_u32(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_frame_flags() {
        let flags = FrameFlags::new()
            .with_request()
            .with_chunked()
            .with_compression(CompressionMode::Lz4)
            .with_encryption(EncryptionMode::new(2).unwrap());

        assert!(flags.is_request());
        assert!(!flags.is_response());
        assert!(flags.is_chunked());
        assert_eq!(flags.compression().unwrap(), CompressionMode::Lz4);
        assert_eq!(flags.encryption().tag(), 2);
        assert_eq!(flags.meta_len(), REQUEST_META_SIZE + CHUNK_META_SIZE);
        assert!(flags.validate().is_ok());
    }

    #[test]
    fn test_invalid_flags() {
        assert!(matches!(
            FrameFlags::from_bits(0x80),
            Err(ProtocolError::InvalidFlags(0x80))
        ));
        assert!(matches!(
            FrameFlags::from_bits(0b0001_0000),
            Err(ProtocolError::UnsupportedCompression(2))
        ));
        assert!(FrameFlags::from_bits(FrameFlags::REQUEST | FrameFlags::RESPONSE).is_err());
        assert!(matches!(
            EncryptionMode::new(4),
            Err(ProtocolError::InvalidEncryptionTag(4))
        ));
    }

    #[test]
    fn test_header_checksum_detects_corruption() {
        let header = FrameHeader::new(FrameFlags::new().with_request(), 7, 12);
        assert!(header.verify().is_ok());

        let mut bytes = header.to_bytes();
        bytes[2] ^= 0x01;
        let corrupted = FrameHeader::parse(&bytes).unwrap();
        assert!(matches!(
            corrupted.verify(),
            Err(ProtocolError::HeaderChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_chunk_info_layout() {
        let info = ChunkInfo {
            packet_id: 1,
            offset: 0x0102_0304,
            total_len: 9,
        };
        let mut buf = Vec::new();
        info.put(&mut buf);
        assert_eq!(buf.len(), CHUNK_META_SIZE);
        assert_eq!(&buf[4..8], &[1, 2, 3, 4]);
        assert_eq!(ChunkInfo::parse(&buf), Some(info));
        assert_eq!(ChunkInfo::parse(&buf[..11]), None);
    }

    proptest! {
        #[test]
        fn prop_header_roundtrip(
            route in 0u8..3,
            chunked in any::<bool>(),
            lz4 in any::<bool>(),
            enc in 0u8..4,
            id in any::<u16>(),
            data_len in any::<u16>(),
        ) {
            let mut flags = FrameFlags::new();
            flags = match route {
                0 => flags,
                1 => flags.with_request(),
                _ => flags.with_response(),
            };
            if chunked {
                flags = flags.with_chunked();
            }
            if lz4 {
                flags = flags.with_compression(CompressionMode::Lz4);
            }
            flags = flags.with_encryption(EncryptionMode::new(enc).unwrap());

            let header = FrameHeader::new(flags, id, data_len);
            let parsed = FrameHeader::parse(&header.to_bytes()).unwrap();
            prop_assert_eq!(parsed, header);
            prop_assert!(parsed.verify().is_ok());
            prop_assert_eq!(parsed.flags.is_request(), route == 1);
            prop_assert_eq!(parsed.flags.is_response(), route == 2);
            prop_assert_eq!(parsed.flags.is_chunked(), chunked);
            prop_assert_eq!(parsed.flags.encryption().tag(), enc);
        }
    }
}
