//! Reassembly of chunked messages.
//!
//! Each in-progress message owns a pooled destination buffer sized to the
//! message's total length. Chunks are copied into place under a per-entry
//! lock, so copies for different messages never contend. The entry is removed
//! and its buffer handed to the caller the moment the last byte arrives.
//!
//! With an idle timeout configured, entries that stop receiving chunks are
//! evicted by [`ChunkReassembler::sweep_expired`], normally driven by the
//! background task from [`ChunkReassembler::spawn_sweeper`].

use crate::ConnectionKey;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tidewire_protocol::{BufferPool, PooledBuf, ProtocolError, MAX_MESSAGE_SIZE};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Identifies one chunked message.
///
/// Packet ids are allocated per sender, so the source connection is part of
/// the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReassemblyKey {
    pub source: ConnectionKey,
    pub packet_id: u32,
}

impl ReassemblyKey {
    pub fn new(source: ConnectionKey, packet_id: u32) -> Self {
        Self { source, packet_id }
    }
}

struct EntryState {
    /// `None` once the entry has completed, failed or been evicted.
    buf: Option<PooledBuf>,
    /// Filled ranges, start -> end.
    filled: BTreeMap<u32, u32>,
    remaining: u32,
    last_touched: Instant,
}

impl EntryState {
    fn overlaps(&self, start: u32, end: u32) -> bool {
        if let Some((_, &prev_end)) = self.filled.range(..=start).next_back() {
            if prev_end > start {
                return true;
            }
        }
        if let Some((&next_start, _)) = self.filled.range(start..).next() {
            if next_start < end {
                return true;
            }
        }
        false
    }

    /// Records `[start, end)` as filled, merging with an adjacent range.
    fn mark_filled(&mut self, start: u32, end: u32) {
        let mut start = start;
        if let Some((&prev_start, &prev_end)) = self.filled.range(..start).next_back() {
            if prev_end == start {
                self.filled.remove(&prev_start);
                start = prev_start;
            }
        }
        let mut end = end;
        if let Some(next_end) = self.filled.remove(&end) {
            end = next_end;
        }
        self.filled.insert(start, end);
    }
}

struct Entry {
    total_len: u32,
    state: Mutex<EntryState>,
}

/// Reassembly counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub completed: u64,
    /// Entries dropped by idle eviction or connection close.
    pub evicted: u64,
    /// Entries dropped because a chunk was invalid.
    pub discarded: u64,
    pub in_flight: usize,
}

/// Keyed store of partially received messages.
pub struct ChunkReassembler {
    entries: DashMap<ReassemblyKey, Arc<Entry>>,
    pool: BufferPool,
    idle_timeout: Option<Duration>,
    max_message_size: usize,
    completed: AtomicU64,
    evicted: AtomicU64,
    discarded: AtomicU64,
}

impl ChunkReassembler {
    /// Creates a reassembler that keeps partial messages until they complete
    /// or their connection goes away.
    pub fn new(pool: BufferPool) -> Self {
        Self {
            entries: DashMap::new(),
            pool,
            idle_timeout: None,
            max_message_size: MAX_MESSAGE_SIZE,
            completed: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Creates a reassembler that evicts partial messages idle for longer
    /// than `idle_timeout`.
    pub fn with_idle_timeout(pool: BufferPool, idle_timeout: Duration) -> Self {
        Self {
            idle_timeout: Some(idle_timeout),
            ..Self::new(pool)
        }
    }

    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Number of messages currently being reassembled.
    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> ReassemblyStats {
        ReassemblyStats {
            completed: self.completed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            in_flight: self.entries.len(),
        }
    }

    /// Copies one chunk into its message and returns the full message once
    /// every byte of `[0, total_len)` has arrived.
    ///
    /// A chunk that falls outside the message, overlaps an earlier chunk or
    /// disagrees on `total_len` fails with [`ProtocolError::ChunkOverflow`]
    /// and the whole message is discarded.
    pub fn receive(
        &self,
        key: ReassemblyKey,
        chunk: &[u8],
        offset: u32,
        total_len: u32,
    ) -> Result<Option<PooledBuf>, ProtocolError> {
        let end = offset as u64 + chunk.len() as u64;
        let overflow = |reason| ProtocolError::ChunkOverflow {
            offset,
            end,
            total: total_len,
            reason,
        };

        if chunk.is_empty() {
            return Err(overflow("empty chunk"));
        }
        if end > total_len as u64 {
            return Err(overflow("chunk extends past total length"));
        }
        if total_len as usize > self.max_message_size {
            return Err(overflow("total length exceeds message limit"));
        }

        loop {
            let entry = self.entry_for(key, total_len)?;
            let now = Instant::now();

            let mut state = entry.state.lock();
            if state.buf.is_none() {
                // Finished by another path between lookup and lock.
                drop(state);
                self.entries.remove_if(&key, |_, e| Arc::ptr_eq(e, &entry));
                continue;
            }

            let violation = if entry.total_len != total_len {
                Some("total length differs from first chunk")
            } else if state.overlaps(offset, end as u32) {
                Some("chunk overlaps received data")
            } else {
                None
            };

            if let Some(reason) = violation {
                state.buf = None;
                drop(state);
                self.entries.remove_if(&key, |_, e| Arc::ptr_eq(e, &entry));
                self.discarded.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "discarding reassembly {:?} (packet_id={}): {}",
                    key.source,
                    key.packet_id,
                    reason
                );
                return Err(overflow(reason));
            }

            let start = offset as usize;
            if let Some(buf) = state.buf.as_mut() {
                buf[start..start + chunk.len()].copy_from_slice(chunk);
            }
            state.mark_filled(offset, end as u32);
            state.remaining -= chunk.len() as u32;
            state.last_touched = now;

            if state.remaining > 0 {
                return Ok(None);
            }

            let assembled = state.buf.take();
            drop(state);
            self.entries.remove_if(&key, |_, e| Arc::ptr_eq(e, &entry));
            self.completed.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                "reassembled {} bytes from {} (packet_id={})",
                total_len,
                key.source,
                key.packet_id
            );
            return Ok(assembled);
        }
    }

    fn entry_for(&self, key: ReassemblyKey, total_len: u32) -> Result<Arc<Entry>, ProtocolError> {
        match self.entries.entry(key) {
            MapEntry::Occupied(occupied) => Ok(Arc::clone(occupied.get())),
            MapEntry::Vacant(vacant) => {
                let buf = self.pool.rent(total_len as usize)?;
                let entry = Arc::new(Entry {
                    total_len,
                    state: Mutex::new(EntryState {
                        buf: Some(buf),
                        filled: BTreeMap::new(),
                        remaining: total_len,
                        last_touched: Instant::now(),
                    }),
                });
                vacant.insert(Arc::clone(&entry));
                tracing::trace!(
                    "started reassembly of {} bytes from {} (packet_id={})",
                    total_len,
                    key.source,
                    key.packet_id
                );
                Ok(entry)
            }
        }
    }

    /// Drops one entry, returning its buffer to the pool.
    fn evict(&self, key: &ReassemblyKey) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                entry.state.lock().buf = None;
                self.evicted.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Drops every partial message received from `source`.
    pub fn evict_source(&self, source: ConnectionKey) -> usize {
        let keys: Vec<ReassemblyKey> = self
            .entries
            .iter()
            .filter(|e| e.key().source == source)
            .map(|e| *e.key())
            .collect();

        let evicted = keys.iter().filter(|key| self.evict(key)).count();
        if evicted > 0 {
            tracing::debug!("evicted {} partial messages from {}", evicted, source);
        }
        evicted
    }

    /// Evicts entries whose last chunk arrived more than the idle timeout
    /// before `now`. Does nothing without an idle timeout.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let Some(idle) = self.idle_timeout else {
            return 0;
        };
        let is_stale =
            |entry: &Entry| now.saturating_duration_since(entry.state.lock().last_touched) >= idle;

        let stale: Vec<ReassemblyKey> = self
            .entries
            .iter()
            .filter(|e| is_stale(e.value()))
            .map(|e| *e.key())
            .collect();

        let mut evicted = 0;
        for key in stale {
            // Re-check under the shard lock; a chunk may have arrived since.
            if let Some((_, entry)) = self.entries.remove_if(&key, |_, e| is_stale(e)) {
                entry.state.lock().buf = None;
                self.evicted.fetch_add(1, Ordering::Relaxed);
                evicted += 1;
                tracing::warn!(
                    "evicted idle reassembly from {} (packet_id={})",
                    key.source,
                    key.packet_id
                );
            }
        }
        evicted
    }

    /// Starts a background task calling [`sweep_expired`](Self::sweep_expired)
    /// every `interval`. Must be called within a Tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let signal = Arc::new(SweeperSignal {
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        });
        let reassembler = Arc::clone(self);
        let task_signal = Arc::clone(&signal);

        let task = tokio::spawn(async move {
            tracing::debug!("reassembly sweeper started (interval={:?})", interval);
            loop {
                tokio::select! {
                    _ = task_signal.notify.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }

                if task_signal.shutdown.load(Ordering::Relaxed) {
                    break;
                }

                reassembler.sweep_expired(Instant::now());
            }
            tracing::debug!("reassembly sweeper stopped");
        });

        SweeperHandle { signal, task }
    }
}

impl std::fmt::Debug for ChunkReassembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkReassembler")
            .field("in_flight", &self.entries.len())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

struct SweeperSignal {
    shutdown: AtomicBool,
    notify: Notify,
}

/// Handle to a running sweeper task.
pub struct SweeperHandle {
    signal: Arc<SweeperSignal>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signals the sweeper to stop after its current pass.
    pub fn shutdown(&self) {
        self.signal.shutdown.store(true, Ordering::Relaxed);
        self.signal.notify.notify_one();
    }

    /// Stops the sweeper and waits for it to exit.
    pub async fn stop(self) {
        self.shutdown();
        if let Err(e) = self.task.await {
            tracing::warn!("reassembly sweeper ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
