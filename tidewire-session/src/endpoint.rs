//! Endpoint: the receive and send paths for a set of connections.
//!
//! The transport owns sockets. It hands inbound bytes to
//! [`Endpoint::deliver_bytes`] and receives outbound frames through
//! [`Transport::send_frame`]. Each connection gets its own [`FrameDecoder`];
//! reassembly, request correlation and dispatch are shared.

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::SessionError;
use crate::pending::{PendingRequestTable, PendingResponse, PendingStats};
use crate::reassembly::{ChunkReassembler, ReassemblyKey, ReassemblyStats, SweeperHandle};
use crate::ConnectionKey;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidewire_protocol::{
    BufferPool, DecoderStats, EncryptionMode, Frame, FrameDecoder, FrameEncoder,
    OutboundMessage, Packet, PoolStats, ProtocolError,
};

/// Socket layer collaborator.
pub trait Transport: Send + Sync {
    /// Writes one encoded frame to `conn`.
    fn send_frame(&self, conn: ConnectionKey, frame: Bytes) -> Result<(), SessionError>;

    /// Largest message body `conn` carries in a single frame.
    fn max_payload_size(&self, conn: ConnectionKey) -> usize;
}

#[derive(Default)]
struct Counters {
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
}

/// Point-in-time endpoint statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub connections: usize,
    pub bytes_received: u64,
    pub frames_sent: u64,
    /// Complete packets handed to dispatch.
    pub packets_received: u64,
    /// Frames or messages rejected after a valid header.
    pub packets_dropped: u64,
    /// Totals over currently open connections.
    pub decoder: DecoderStats,
    pub reassembly: ReassemblyStats,
    pub requests: PendingStats,
    pub pool: PoolStats,
}

/// One side of a tidewire conversation over any number of connections.
pub struct Endpoint {
    config: Config,
    transport: Arc<dyn Transport>,
    pool: BufferPool,
    encoder: FrameEncoder,
    decoders: DashMap<ConnectionKey, Arc<Mutex<FrameDecoder>>>,
    reassembler: Arc<ChunkReassembler>,
    pending: Arc<PendingRequestTable>,
    dispatcher: Dispatcher,
    counters: Counters,
}

impl Endpoint {
    /// Creates an endpoint from validated configuration.
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self, SessionError> {
        config.validate()?;

        let pool = BufferPool::new(config.pool.pool_config());
        let encoder = FrameEncoder::new(config.codec.codec_config(), pool.clone());
        let reassembler = match config.reassembly.idle_timeout() {
            Some(idle) => ChunkReassembler::with_idle_timeout(pool.clone(), idle),
            None => ChunkReassembler::new(pool.clone()),
        }
        .with_max_message_size(config.codec.max_message_size);

        Ok(Self {
            config,
            transport,
            pool,
            encoder,
            decoders: DashMap::new(),
            reassembler: Arc::new(reassembler),
            pending: Arc::new(PendingRequestTable::new()),
            dispatcher: Dispatcher::new(),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn pending(&self) -> &Arc<PendingRequestTable> {
        &self.pending
    }

    pub fn reassembler(&self) -> &Arc<ChunkReassembler> {
        &self.reassembler
    }

    /// Starts idle eviction of partial messages, if enabled in the config.
    /// Must be called within a Tokio runtime.
    pub fn start_sweeper(&self) -> Option<SweeperHandle> {
        self.reassembler.idle_timeout()?;
        Some(
            self.reassembler
                .spawn_sweeper(self.config.reassembly.sweep_interval()),
        )
    }

    fn decoder_for(&self, conn: ConnectionKey) -> Result<Arc<Mutex<FrameDecoder>>, SessionError> {
        if let Some(decoder) = self.decoders.get(&conn) {
            return Ok(Arc::clone(decoder.value()));
        }

        let decoder = FrameDecoder::new(
            self.config.codec.ring_capacity,
            self.pool.clone(),
            self.config.codec.max_message_size,
        )?;
        let decoder = self
            .decoders
            .entry(conn)
            .or_insert_with(|| Arc::new(Mutex::new(decoder)));
        tracing::debug!("opened decoder for {}", conn);
        Ok(Arc::clone(decoder.value()))
    }

    /// Feeds bytes received on `conn` through decoding, reassembly and
    /// dispatch. Returns the number of complete packets dispatched.
    ///
    /// Corrupt frames are skipped. An error means a packet could not be
    /// processed for a reason unrelated to the byte stream, such as pool
    /// exhaustion. That packet is lost, but every other complete frame in
    /// `bytes` is still decoded and dispatched.
    pub fn deliver_bytes(
        &self,
        conn: ConnectionKey,
        bytes: &[u8],
    ) -> Result<usize, SessionError> {
        self.counters
            .bytes_received
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let decoder = self.decoder_for(conn)?;
        let mut packets = Vec::new();
        let result = {
            let mut decoder = decoder.lock();
            self.decode_into(conn, &mut decoder, bytes, &mut packets)
        };

        let count = packets.len();
        self.counters
            .packets_received
            .fetch_add(count as u64, Ordering::Relaxed);
        for packet in packets {
            let outcome = self.dispatcher.dispatch(conn, packet, &self.pending);
            tracing::trace!("dispatched packet from {}: {:?}", conn, outcome);
        }

        result.map(|()| count).map_err(SessionError::from)
    }

    /// Drains every complete frame. A frame that fails for a non-stream
    /// reason is dropped like a corrupt one; the first such error is returned
    /// once nothing more can be decoded.
    fn decode_into(
        &self,
        conn: ConnectionKey,
        decoder: &mut FrameDecoder,
        mut bytes: &[u8],
        packets: &mut Vec<Packet>,
    ) -> Result<(), ProtocolError> {
        let mut first_error = None;
        loop {
            let taken = decoder.extend(bytes);
            bytes = &bytes[taken..];

            let mut decoded = 0;
            loop {
                let result = match decoder.decode_frame() {
                    Ok(Some(frame)) => self.assemble(conn, frame),
                    Ok(None) => break,
                    Err(e) => Err(e),
                };
                decoded += 1;
                match result {
                    Ok(Some(packet)) => packets.push(packet),
                    Ok(None) => {}
                    Err(e) => {
                        self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("dropping message from {}: {}", conn, e);
                        if !e.is_recoverable() && first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }

            if bytes.is_empty() {
                break;
            }
            if taken == 0 && decoded == 0 {
                // A full ring always holds a frame or a resync point.
                tracing::error!("decoder for {} stalled; clearing", conn);
                decoder.clear();
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Turns a frame into a packet, routing chunks through reassembly.
    fn assemble(&self, conn: ConnectionKey, frame: Frame) -> Result<Option<Packet>, ProtocolError> {
        let max = self.config.codec.max_message_size;
        let Some(info) = frame.chunk else {
            return frame.into_packet(&self.pool, max).map(Some);
        };

        let key = ReassemblyKey::new(conn, info.packet_id);
        let assembled = self
            .reassembler
            .receive(key, frame.body(), info.offset, info.total_len)?;
        match assembled {
            Some(buf) => {
                Packet::from_wire(frame.route, frame.header.flags, buf, 0, &self.pool, max)
                    .map(Some)
            }
            None => Ok(None),
        }
    }

    fn send_message(
        &self,
        conn: ConnectionKey,
        msg: &OutboundMessage<'_>,
    ) -> Result<usize, SessionError> {
        let max_payload = self.transport.max_payload_size(conn);
        let frames = self.encoder.encode(msg, max_payload)?;
        let count = frames.len();
        for frame in frames {
            self.transport.send_frame(conn, frame)?;
        }
        self.counters
            .frames_sent
            .fetch_add(count as u64, Ordering::Relaxed);
        Ok(count)
    }

    /// Sends an uncorrelated command. Returns the number of frames written.
    pub fn send(
        &self,
        conn: ConnectionKey,
        command: u16,
        payload: &[u8],
    ) -> Result<usize, SessionError> {
        self.send_message(conn, &OutboundMessage::command(command, payload))
    }

    /// Like [`send`](Self::send), tagging the frames with an encryption mode.
    /// The payload must already be sealed by the caller.
    pub fn send_sealed(
        &self,
        conn: ConnectionKey,
        command: u16,
        payload: &[u8],
        encryption: EncryptionMode,
    ) -> Result<usize, SessionError> {
        self.send_message(
            conn,
            &OutboundMessage::command(command, payload).with_encryption(encryption),
        )
    }

    /// Sends a request and returns a handle resolving to its response, a
    /// timeout, or cancellation. Must be called within a Tokio runtime for
    /// the timeout to be armed.
    pub fn request(
        &self,
        conn: ConnectionKey,
        command: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<PendingResponse, SessionError> {
        let pending = self.pending.register(conn)?;
        let request_id = pending.request_id();
        self.pending.cancel_on_timeout(request_id, timeout);

        let msg = OutboundMessage::request(command, request_id, payload);
        if let Err(e) = self.send_message(conn, &msg) {
            self.pending.cancel(request_id);
            return Err(e);
        }
        Ok(pending)
    }

    /// Sends a request using the configured default timeout.
    pub fn request_default(
        &self,
        conn: ConnectionKey,
        command: u16,
        payload: &[u8],
    ) -> Result<PendingResponse, SessionError> {
        self.request(conn, command, payload, self.config.requests.timeout())
    }

    /// Answers a request received as `request`.
    pub fn respond(
        &self,
        conn: ConnectionKey,
        request: &Packet,
        payload: &[u8],
    ) -> Result<usize, SessionError> {
        let Some(request_id) = request.request_id() else {
            return Err(ProtocolError::ReservedRequestId.into());
        };
        self.respond_to(conn, request_id, request.command(), payload)
    }

    /// Answers request `request_id` for `command`.
    pub fn respond_to(
        &self,
        conn: ConnectionKey,
        request_id: u16,
        command: u16,
        payload: &[u8],
    ) -> Result<usize, SessionError> {
        self.send_message(conn, &OutboundMessage::response(request_id, command, payload))
    }

    /// Releases all state held for `conn`.
    pub fn on_disconnect(&self, conn: ConnectionKey) {
        let had_decoder = self.decoders.remove(&conn).is_some();
        let partial = self.reassembler.evict_source(conn);
        let cancelled = self.pending.cancel_connection(conn);
        tracing::debug!(
            "closed {} (decoder={}, partial messages={}, cancelled requests={})",
            conn,
            had_decoder,
            partial,
            cancelled
        );
    }

    pub fn connections(&self) -> usize {
        self.decoders.len()
    }

    pub fn stats(&self) -> EndpointStats {
        let decoders: Vec<Arc<Mutex<FrameDecoder>>> =
            self.decoders.iter().map(|e| Arc::clone(e.value())).collect();
        let mut decoder = DecoderStats::default();
        for d in &decoders {
            let s = d.lock().stats();
            decoder.frames_decoded += s.frames_decoded;
            decoder.resyncs += s.resyncs;
            decoder.corrupt_frames += s.corrupt_frames;
            decoder.bytes_discarded += s.bytes_discarded;
        }

        EndpointStats {
            connections: decoders.len(),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.counters.packets_dropped.load(Ordering::Relaxed),
            decoder,
            reassembly: self.reassembler.stats(),
            requests: self.pending.stats(),
            pool: self.pool.stats(),
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("connections", &self.decoders.len())
            .field("reassembler", &self.reassembler)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
