//! Byte-stuffed, checksummed payload encoding.
//!
//! The payload region of a frame is `COBS(data | crc32c(data)) | 0x00`.
//! Consistent Overhead Byte Stuffing removes every zero byte from the encoded
//! form, so the trailing `0x00` is the only zero in a frame's payload region and
//! a stream reader can always find the next candidate frame boundary by
//! scanning for it.

use crate::error::ProtocolError;

/// Frame boundary marker.
pub const TERMINATOR: u8 = 0x00;

/// Size of the trailing payload checksum.
pub const CHECKSUM_SIZE: usize = 4;

const MAX_BLOCK: u8 = 0xFF;

/// Computes the 16-bit header checksum (CRC32C folded in half).
pub fn header_checksum(bytes: &[u8]) -> u16 {
    let crc = crc32c::crc32c(bytes);
    ((crc >> 16) ^ crc) as u16
}

/// Checksums recovered while decoding a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadChecksum {
    /// Recomputed over the decoded bytes.
    pub computed: u32,
    /// Carried at the end of the encoded payload.
    pub carried: u32,
}

impl PayloadChecksum {
    pub fn is_valid(&self) -> bool {
        self.computed == self.carried
    }

    pub fn verify(&self) -> Result<(), ProtocolError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(ProtocolError::ChecksumMismatch {
                expected: self.carried,
                actual: self.computed,
            })
        }
    }
}

/// Incremental COBS encoder writing into a vector.
struct StuffingWriter<'a> {
    out: &'a mut Vec<u8>,
    code_idx: usize,
    code: u8,
}

impl<'a> StuffingWriter<'a> {
    fn new(out: &'a mut Vec<u8>) -> Self {
        let code_idx = out.len();
        out.push(0);
        Self {
            out,
            code_idx,
            code: 1,
        }
    }

    fn close_block(&mut self) {
        self.out[self.code_idx] = self.code;
        self.code_idx = self.out.len();
        self.out.push(0);
        self.code = 1;
    }

    fn write(&mut self, data: &[u8]) {
        for &byte in data {
            if byte == 0 {
                self.close_block();
            } else {
                self.out.push(byte);
                self.code += 1;
                if self.code == MAX_BLOCK {
                    self.close_block();
                }
            }
        }
    }

    fn finish(self) {
        self.out[self.code_idx] = self.code;
    }
}

/// Streaming COBS decoder; accepts the encoded region in any number of pieces.
#[derive(Debug, Default)]
struct UnstuffingReader {
    remaining: u8,
    code: u8,
    started: bool,
}

impl UnstuffingReader {
    fn feed(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        for &byte in data {
            if byte == TERMINATOR {
                return Err(ProtocolError::MalformedPayload(
                    "zero byte inside stuffed region",
                ));
            }
            if self.remaining == 0 {
                if self.started && self.code != MAX_BLOCK {
                    out.push(0);
                }
                self.code = byte;
                self.remaining = byte - 1;
                self.started = true;
            } else {
                out.push(byte);
                self.remaining -= 1;
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<(), ProtocolError> {
        if !self.started {
            return Err(ProtocolError::MalformedPayload("empty stuffed region"));
        }
        if self.remaining != 0 {
            return Err(ProtocolError::MalformedPayload("truncated stuffing block"));
        }
        Ok(())
    }
}

/// Encoder/decoder for the payload region of a frame.
pub struct PayloadCodec;

impl PayloadCodec {
    /// Upper bound on the encoded size (terminator included) of `raw_len` bytes.
    pub fn encoded_len_bound(raw_len: usize) -> usize {
        let stuffed = raw_len + CHECKSUM_SIZE;
        stuffed + stuffed / (MAX_BLOCK as usize - 1) + 2
    }

    /// Appends `COBS(parts... | crc32c) | 0x00` to `out`. The parts are treated
    /// as one contiguous payload.
    pub fn encode_into(parts: &[&[u8]], out: &mut Vec<u8>) {
        let raw_len: usize = parts.iter().map(|p| p.len()).sum();
        out.reserve(Self::encoded_len_bound(raw_len));

        let mut crc = 0u32;
        let mut writer = StuffingWriter::new(out);
        for part in parts {
            crc = crc32c::crc32c_append(crc, part);
            writer.write(part);
        }
        writer.write(&crc.to_be_bytes());
        writer.finish();
        out.push(TERMINATOR);
    }

    /// Encodes a single payload into a fresh vector.
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        Self::encode_into(&[payload], &mut out);
        out
    }

    /// Decodes a stuffed region (terminator excluded) into `out` and returns
    /// both checksums. `out` receives only the payload; the caller decides
    /// what to do on mismatch.
    pub fn decode(encoded: &[u8], out: &mut Vec<u8>) -> Result<PayloadChecksum, ProtocolError> {
        Self::decode_slices(encoded, &[], out)
    }

    /// Same as [`decode`](Self::decode) for a region split in two pieces, as
    /// handed out by the ring buffer.
    pub fn decode_slices(
        first: &[u8],
        second: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<PayloadChecksum, ProtocolError> {
        let start = out.len();
        let mut reader = UnstuffingReader::default();
        reader.feed(first, out)?;
        reader.feed(second, out)?;
        reader.finish()?;

        let decoded = out.len() - start;
        if decoded < CHECKSUM_SIZE {
            return Err(ProtocolError::MalformedPayload("missing payload checksum"));
        }
        let body_end = out.len() - CHECKSUM_SIZE;
        let carried = u32::from_be_bytes([
            out[body_end],
            out[body_end + 1],
            out[body_end + 2],
            out[body_end + 3],
        ]);
        out.truncate(body_end);
        let computed = crc32c::crc32c(&out[start..]);

        Ok(PayloadChecksum { computed, carried })
    }
}
