//! Logical packets handed to consumers after decoding.

use crate::compression;
use crate::error::ProtocolError;
use crate::frame::{CompressionMode, EncryptionMode, FrameFlags};
use crate::pool::{BufferPool, PooledBuf};

/// How a frame is routed on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Fire-and-forget command.
    Command { command: u16 },
    /// Command whose sender waits for a response correlated by `request_id`.
    Request { command: u16, request_id: u16 },
    /// Response to an earlier request. `command` echoes the request's command.
    Response { request_id: u16, command: u16 },
}

impl Route {
    pub fn command(&self) -> u16 {
        match *self {
            Route::Command { command }
            | Route::Request { command, .. }
            | Route::Response { command, .. } => command,
        }
    }

    /// Correlation id, if any. Never zero.
    pub fn request_id(&self) -> Option<u16> {
        match *self {
            Route::Command { .. } => None,
            Route::Request { request_id, .. } | Route::Response { request_id, .. } => {
                Some(request_id)
            }
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Route::Response { .. })
    }

    /// Value carried in the header id field.
    pub(crate) fn header_id(&self) -> u16 {
        match *self {
            Route::Command { command } | Route::Request { command, .. } => command,
            Route::Response { request_id, .. } => request_id,
        }
    }

    /// Value carried in the 2-byte metadata block, if any.
    pub(crate) fn meta_id(&self) -> Option<u16> {
        match *self {
            Route::Command { .. } => None,
            Route::Request { request_id, .. } => Some(request_id),
            Route::Response { command, .. } => Some(command),
        }
    }

    pub(crate) fn flags(&self) -> FrameFlags {
        match self {
            Route::Command { .. } => FrameFlags::new(),
            Route::Request { .. } => FrameFlags::new().with_request(),
            Route::Response { .. } => FrameFlags::new().with_response(),
        }
    }
}

/// A fully received message: reassembled and decompressed.
///
/// Owns its pooled buffer; dropping the packet returns the buffer to the pool.
/// Packets are moved, never shared, so exactly one consumer releases each one.
pub struct Packet {
    route: Route,
    encryption: EncryptionMode,
    buf: PooledBuf,
    offset: usize,
    len: usize,
}

impl Packet {
    /// Wraps `buf[offset..]` as the packet payload.
    pub fn new(route: Route, encryption: EncryptionMode, buf: PooledBuf, offset: usize) -> Self {
        let offset = offset.min(buf.len());
        let len = buf.len() - offset;
        Self {
            route,
            encryption,
            buf,
            offset,
            len,
        }
    }

    /// Builds a packet from wire bytes, decompressing according to `flags`.
    pub fn from_wire(
        route: Route,
        flags: FrameFlags,
        buf: PooledBuf,
        offset: usize,
        pool: &BufferPool,
        max_len: usize,
    ) -> Result<Self, ProtocolError> {
        let mode = flags.compression()?;
        let encryption = flags.encryption();
        match mode {
            CompressionMode::None => Ok(Self::new(route, encryption, buf, offset)),
            CompressionMode::Lz4 => {
                let data = buf.get(offset..).unwrap_or_default();
                let plain = compression::decompress(mode, data, max_len, pool)?;
                Ok(Self::new(route, encryption, plain, 0))
            }
        }
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn command(&self) -> u16 {
        self.route.command()
    }

    pub fn request_id(&self) -> Option<u16> {
        self.route.request_id()
    }

    pub fn encryption(&self) -> EncryptionMode {
        self.encryption
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.offset..self.offset + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("route", &self.route)
            .field("encryption", &self.encryption)
            .field("len", &self.len)
            .finish()
    }
}
