//! Frame encoder and incremental, self-synchronizing frame decoder.

use crate::compression;
use crate::error::ProtocolError;
use crate::frame::{
    ChunkInfo, CompressionMode, EncryptionMode, FrameFlags, FrameHeader, CHUNK_META_SIZE,
    HEADER_SIZE, REQUEST_META_SIZE,
};
use crate::packet::{Packet, Route};
use crate::payload::{PayloadCodec, CHECKSUM_SIZE, TERMINATOR};
use crate::pool::{BufferPool, PooledBuf};
use crate::ring::RingBuffer;
use crate::MAX_MESSAGE_SIZE;
use bytes::{Buf, BufMut, Bytes};
use std::sync::atomic::{AtomicU32, Ordering};

/// Largest message body carried by a single frame. Larger messages are chunked.
pub const MAX_FRAME_BODY: usize = 65_000;

/// Smallest ring capacity that can hold any frame.
pub const MIN_DECODER_CAPACITY: usize = HEADER_SIZE + u16::MAX as usize;

/// Default decoder ring capacity (128 KiB).
pub const DEFAULT_DECODER_CAPACITY: usize = 128 * 1024;

const MAX_META_SIZE: usize = REQUEST_META_SIZE + CHUNK_META_SIZE;

/// Encoder settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    /// Compression applied to payloads at or above `compression_threshold`.
    pub compression: CompressionMode,
    pub compression_threshold: usize,
    /// Largest message accepted in either direction.
    pub max_message_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression: CompressionMode::Lz4,
            compression_threshold: compression::DEFAULT_COMPRESSION_THRESHOLD,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl CodecConfig {
    pub fn with_compression(mut self, mode: CompressionMode, threshold: usize) -> Self {
        self.compression = mode;
        self.compression_threshold = threshold;
        self
    }

    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }
}

/// A message to be framed.
#[derive(Debug, Clone, Copy)]
pub struct OutboundMessage<'a> {
    pub route: Route,
    pub payload: &'a [u8],
    pub encryption: EncryptionMode,
}

impl<'a> OutboundMessage<'a> {
    pub fn command(command: u16, payload: &'a [u8]) -> Self {
        Self {
            route: Route::Command { command },
            payload,
            encryption: EncryptionMode::NONE,
        }
    }

    pub fn request(command: u16, request_id: u16, payload: &'a [u8]) -> Self {
        Self {
            route: Route::Request {
                command,
                request_id,
            },
            payload,
            encryption: EncryptionMode::NONE,
        }
    }

    pub fn response(request_id: u16, command: u16, payload: &'a [u8]) -> Self {
        Self {
            route: Route::Response {
                request_id,
                command,
            },
            payload,
            encryption: EncryptionMode::NONE,
        }
    }

    pub fn with_encryption(mut self, mode: EncryptionMode) -> Self {
        self.encryption = mode;
        self
    }
}

/// Turns outbound messages into wire frames, compressing and chunking as needed.
pub struct FrameEncoder {
    config: CodecConfig,
    pool: BufferPool,
    next_packet_id: AtomicU32,
}

impl FrameEncoder {
    pub fn new(config: CodecConfig, pool: BufferPool) -> Self {
        Self {
            config,
            pool,
            next_packet_id: AtomicU32::new(1),
        }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Packet ids are never zero; zero marks "not chunked".
    fn allocate_packet_id(&self) -> u32 {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Encodes `msg` into one frame, or into a chunk sequence when the
    /// (possibly compressed) payload exceeds `max_payload`.
    pub fn encode(
        &self,
        msg: &OutboundMessage<'_>,
        max_payload: usize,
    ) -> Result<Vec<Bytes>, ProtocolError> {
        if msg.route.request_id() == Some(0) {
            return Err(ProtocolError::ReservedRequestId);
        }
        if msg.payload.len() > self.config.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: msg.payload.len(),
                max: self.config.max_message_size,
            });
        }

        let compressed = compression::maybe_compress(
            msg.payload,
            self.config.compression,
            self.config.compression_threshold,
            &self.pool,
        );
        let (data, mode): (&[u8], CompressionMode) = match &compressed {
            Some(buf) => (&buf[..], self.config.compression),
            None => (msg.payload, CompressionMode::None),
        };

        let flags = msg
            .route
            .flags()
            .with_compression(mode)
            .with_encryption(msg.encryption);
        let max_body = max_payload.clamp(1, MAX_FRAME_BODY);

        if data.len() <= max_body {
            return Ok(vec![self.encode_frame(flags, &msg.route, None, data)?]);
        }

        let packet_id = self.allocate_packet_id();
        let flags = flags.with_chunked();
        let total_len = data.len() as u32;
        let mut frames = Vec::with_capacity((data.len() + max_body - 1) / max_body);
        for (i, chunk) in data.chunks(max_body).enumerate() {
            let info = ChunkInfo {
                packet_id,
                offset: (i * max_body) as u32,
                total_len,
            };
            frames.push(self.encode_frame(flags, &msg.route, Some(info), chunk)?);
        }

        tracing::trace!(
            "split {} byte message into {} chunks (packet_id={})",
            data.len(),
            frames.len(),
            packet_id
        );
        Ok(frames)
    }

    fn encode_frame(
        &self,
        flags: FrameFlags,
        route: &Route,
        chunk: Option<ChunkInfo>,
        body: &[u8],
    ) -> Result<Bytes, ProtocolError> {
        let mut meta = [0u8; MAX_META_SIZE];
        let meta_len = {
            let mut w = &mut meta[..];
            if let Some(id) = route.meta_id() {
                w.put_u16(id);
            }
            if let Some(info) = chunk {
                info.put(&mut w);
            }
            MAX_META_SIZE - w.len()
        };

        let mut frame = Vec::with_capacity(
            HEADER_SIZE + PayloadCodec::encoded_len_bound(meta_len + body.len()),
        );
        frame.resize(HEADER_SIZE, 0);
        PayloadCodec::encode_into(&[&meta[..meta_len], body], &mut frame);

        let data_len = frame.len() - HEADER_SIZE;
        if data_len > u16::MAX as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: data_len,
                max: u16::MAX as usize,
            });
        }

        let header = FrameHeader::new(flags, route.header_id(), data_len as u16);
        frame[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        Ok(Bytes::from(frame))
    }
}

/// A decoded, checksum-verified frame.
pub struct Frame {
    pub header: FrameHeader,
    pub route: Route,
    /// Present when the frame is one chunk of a larger message.
    pub chunk: Option<ChunkInfo>,
    body: PooledBuf,
    body_offset: usize,
}

impl Frame {
    /// The frame body, metadata stripped.
    pub fn body(&self) -> &[u8] {
        &self.body[self.body_offset..]
    }

    /// Hands over the pooled buffer and the offset at which the body starts.
    pub fn into_parts(self) -> (PooledBuf, usize) {
        (self.body, self.body_offset)
    }

    /// Converts an unchunked frame into a packet, decompressing if needed.
    pub fn into_packet(self, pool: &BufferPool, max_len: usize) -> Result<Packet, ProtocolError> {
        let flags = self.header.flags;
        let route = self.route;
        Packet::from_wire(route, flags, self.body, self.body_offset, pool, max_len)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("header", &self.header)
            .field("route", &self.route)
            .field("chunk", &self.chunk)
            .field("body_len", &self.body().len())
            .finish()
    }
}

/// Result of inspecting the front of the decoder's buffer.
#[derive(Debug)]
pub enum ParseOutcome {
    /// A complete frame with a valid header is buffered.
    Ready(FrameHeader),
    /// Not enough bytes yet.
    NeedMoreData,
    /// The bytes at the front cannot start a frame; resynchronize.
    Corrupt(ProtocolError),
}

/// Decoder counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    /// Times the decoder scanned forward for a terminator.
    pub resyncs: u64,
    /// Frames with a valid header whose payload was rejected.
    pub corrupt_frames: u64,
    pub bytes_discarded: u64,
}

/// Incremental frame decoder backed by a [`RingBuffer`].
///
/// Feed bytes with [`extend`](Self::extend) and pull frames with
/// [`decode_frame`](Self::decode_frame) until it returns `Ok(None)`.
pub struct FrameDecoder {
    ring: RingBuffer,
    pool: BufferPool,
    max_message_size: usize,
    resyncing: bool,
    stats: DecoderStats,
}

impl FrameDecoder {
    /// Creates a decoder. `capacity` is raised to [`MIN_DECODER_CAPACITY`].
    pub fn new(
        capacity: usize,
        pool: BufferPool,
        max_message_size: usize,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            ring: RingBuffer::with_capacity(capacity.max(MIN_DECODER_CAPACITY))?,
            pool,
            max_message_size,
            resyncing: false,
            stats: DecoderStats::default(),
        })
    }

    /// Buffers as much of `data` as fits; returns the number of bytes taken.
    pub fn extend(&mut self, data: &[u8]) -> usize {
        self.ring.write(data)
    }

    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    pub fn free(&self) -> usize {
        self.ring.free()
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Drops all buffered bytes and any pending resynchronization.
    pub fn clear(&mut self) {
        self.ring.clear();
        self.resyncing = false;
    }

    /// Checks whether a complete, plausible frame sits at the front.
    pub fn try_parse(&self) -> ParseOutcome {
        let Some(header) = self.ring.peek_header(0) else {
            return ParseOutcome::NeedMoreData;
        };
        if let Err(err) = header.verify() {
            return ParseOutcome::Corrupt(err);
        }

        let min_len = header.flags.meta_len() + CHECKSUM_SIZE + 2;
        if (header.data_len as usize) < min_len {
            return ParseOutcome::Corrupt(ProtocolError::MalformedPayload(
                "payload region too short",
            ));
        }

        let frame_len = header.frame_len();
        if self.ring.len() < frame_len {
            return ParseOutcome::NeedMoreData;
        }
        if self.ring.peek_byte(frame_len - 1) != Some(TERMINATOR) {
            return ParseOutcome::Corrupt(ProtocolError::MalformedPayload("missing terminator"));
        }
        ParseOutcome::Ready(header)
    }

    /// Decodes the next frame, skipping over corrupt data.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Errors are returned only
    /// for failures unrelated to the byte stream (e.g. pool exhaustion); the
    /// offending frame has already been consumed when that happens.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            if self.resyncing {
                let before = self.ring.len();
                if self.ring.skip_until(0, TERMINATOR) {
                    self.stats.bytes_discarded += (before - self.ring.len()) as u64;
                    self.resyncing = false;
                } else {
                    self.stats.bytes_discarded += before as u64;
                    self.ring.clear();
                    return Ok(None);
                }
            }

            let header = match self.try_parse() {
                ParseOutcome::Ready(header) => header,
                ParseOutcome::NeedMoreData => return Ok(None),
                ParseOutcome::Corrupt(err) => {
                    tracing::warn!("corrupt frame header ({}), resynchronizing", err);
                    self.stats.resyncs += 1;
                    self.resyncing = true;
                    continue;
                }
            };

            let result = self.decode_region(&header);
            self.ring.consume(header.frame_len());

            match result {
                Ok(frame) => {
                    self.stats.frames_decoded += 1;
                    tracing::trace!(
                        "decoded frame id={} route={:?} body={} bytes",
                        header.id,
                        frame.route,
                        frame.body().len()
                    );
                    return Ok(Some(frame));
                }
                Err(err) if err.is_recoverable() => {
                    self.stats.corrupt_frames += 1;
                    tracing::warn!("dropping frame id={}: {}", header.id, err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn decode_region(&self, header: &FrameHeader) -> Result<Frame, ProtocolError> {
        let region = header.data_len as usize - 1;
        let meta_len = header.flags.meta_len();

        let (first, second) = self.ring.peek_slices(HEADER_SIZE, region).ok_or(
            ProtocolError::IncompleteFrame {
                needed: header.frame_len().saturating_sub(self.ring.len()),
            },
        )?;

        let mut body = self.pool.rent_with_capacity(region)?;
        PayloadCodec::decode_slices(first, second, body.vec_mut())?.verify()?;

        if body.len() < meta_len {
            return Err(ProtocolError::MalformedPayload("metadata block truncated"));
        }

        let mut meta = &body[..meta_len];
        let route = if header.flags.is_request() {
            Route::Request {
                command: header.id,
                request_id: meta.get_u16(),
            }
        } else if header.flags.is_response() {
            Route::Response {
                request_id: header.id,
                command: meta.get_u16(),
            }
        } else {
            Route::Command { command: header.id }
        };
        if route.request_id() == Some(0) {
            return Err(ProtocolError::MalformedPayload("zero request id"));
        }

        let chunk = if header.flags.is_chunked() {
            let info = ChunkInfo::parse(meta)
                .ok_or(ProtocolError::MalformedPayload("chunk metadata truncated"))?;
            validate_chunk(&info, body.len() - meta_len, self.max_message_size)?;
            Some(info)
        } else {
            None
        };

        Ok(Frame {
            header: *header,
            route,
            chunk,
            body,
            body_offset: meta_len,
        })
    }
}

/// Checks a chunk's range against its declared message length.
pub fn validate_chunk(
    info: &ChunkInfo,
    len: usize,
    max_message: usize,
) -> Result<(), ProtocolError> {
    let end = info.offset as u64 + len as u64;
    let overflow = |reason| ProtocolError::ChunkOverflow {
        offset: info.offset,
        end,
        total: info.total_len,
        reason,
    };

    if info.packet_id == 0 {
        return Err(overflow("zero packet id"));
    }
    if len == 0 {
        return Err(overflow("empty chunk"));
    }
    if info.total_len as usize > max_message {
        return Err(overflow("total length exceeds message limit"));
    }
    if end > info.total_len as u64 {
        return Err(overflow("chunk extends past total length"));
    }
    Ok(())
}

impl std::fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecoder")
            .field("ring", &self.ring)
            .field("resyncing", &self.resyncing)
            .field("stats", &self.stats)
            .finish()
    }
}
