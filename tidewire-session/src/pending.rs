//! Request/response correlation.
//!
//! Every correlated request owns one entry keyed by its 16-bit request id.
//! An entry ends exactly once: by a matching response, by its timeout, or by
//! cancellation. Whichever path removes the entry from the table under the
//! lock resolves the waiter; every other path finds nothing and becomes a
//! no-op. A response that loses the race is dropped, which returns its buffer
//! to the pool.

use crate::error::SessionError;
use crate::ConnectionKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidewire_protocol::Packet;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Number of usable request ids (zero is reserved).
pub const MAX_IN_FLIGHT: usize = u16::MAX as usize;

/// How a correlated request ended.
#[derive(Debug)]
pub enum RequestOutcome {
    Response(Packet),
    TimedOut,
    /// The connection closed or the request was withdrawn.
    Cancelled,
}

impl RequestOutcome {
    pub fn into_response(self) -> Option<Packet> {
        match self {
            RequestOutcome::Response(packet) => Some(packet),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestOutcome::TimedOut)
    }
}

struct Waiter {
    conn: ConnectionKey,
    ticket: u64,
    tx: Option<oneshot::Sender<RequestOutcome>>,
    timer: Option<JoinHandle<()>>,
}

impl Waiter {
    fn resolve(mut self, outcome: RequestOutcome) {
        if let Some(tx) = self.tx.take() {
            // A dropped receiver hands the outcome back; dropping it releases
            // any response buffer.
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct TableInner {
    entries: HashMap<u16, Waiter>,
    next_id: u16,
    next_ticket: u64,
}

/// Pending request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingStats {
    pub registered: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Responses that matched no entry.
    pub unmatched: u64,
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    registered: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    unmatched: AtomicU64,
}

/// Table of requests waiting for a response.
pub struct PendingRequestTable {
    inner: Mutex<TableInner>,
    counters: Counters,
}

impl Default for PendingRequestTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                next_id: 1,
                next_ticket: 0,
            }),
            counters: Counters::default(),
        }
    }

    /// Allocates a request id and registers a waiter for it.
    ///
    /// Ids come from one wrapping counter that skips zero and ids still in
    /// flight; allocation and insertion happen under the same lock.
    pub fn register(&self, conn: ConnectionKey) -> Result<PendingResponse, SessionError> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();

        if inner.entries.len() >= MAX_IN_FLIGHT {
            return Err(SessionError::TableFull(inner.entries.len()));
        }

        let request_id = loop {
            let id = inner.next_id;
            inner.next_id = inner.next_id.wrapping_add(1);
            if id != 0 && !inner.entries.contains_key(&id) {
                break id;
            }
        };
        let ticket = inner.next_ticket;
        inner.next_ticket += 1;

        inner.entries.insert(
            request_id,
            Waiter {
                conn,
                ticket,
                tx: Some(tx),
                timer: None,
            },
        );
        drop(inner);

        self.counters.registered.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("registered request {} on {}", request_id, conn);
        Ok(PendingResponse { request_id, rx })
    }

    /// Delivers `packet` to the waiter for `request_id`.
    ///
    /// Returns false if no entry matched; the packet is then dropped and its
    /// buffer returned to the pool.
    pub fn complete(&self, request_id: u16, packet: Packet) -> bool {
        let waiter = self.inner.lock().entries.remove(&request_id);
        self.finish_complete(request_id, waiter, packet)
    }

    /// Like [`complete`](Self::complete), but only matches a request that was
    /// issued on `conn`.
    pub fn complete_from(&self, conn: ConnectionKey, request_id: u16, packet: Packet) -> bool {
        let waiter = {
            let mut inner = self.inner.lock();
            let owned = inner
                .entries
                .get(&request_id)
                .map_or(false, |w| w.conn == conn);
            if owned {
                inner.entries.remove(&request_id)
            } else {
                None
            }
        };
        self.finish_complete(request_id, waiter, packet)
    }

    fn finish_complete(&self, request_id: u16, waiter: Option<Waiter>, packet: Packet) -> bool {
        match waiter {
            Some(waiter) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                waiter.resolve(RequestOutcome::Response(packet));
                true
            }
            None => {
                self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "dropping response {} ({} bytes): no pending request",
                    request_id,
                    packet.len()
                );
                false
            }
        }
    }

    /// Resolves the waiter for `request_id` as timed out.
    pub fn expire(&self, request_id: u16) -> bool {
        let waiter = self.inner.lock().entries.remove(&request_id);
        self.finish_expire(request_id, waiter)
    }

    fn expire_ticket(&self, request_id: u16, ticket: u64) -> bool {
        let waiter = {
            let mut inner = self.inner.lock();
            let current = inner
                .entries
                .get(&request_id)
                .map_or(false, |w| w.ticket == ticket);
            if current {
                inner.entries.remove(&request_id)
            } else {
                None
            }
        };
        self.finish_expire(request_id, waiter)
    }

    fn finish_expire(&self, request_id: u16, waiter: Option<Waiter>) -> bool {
        match waiter {
            Some(mut waiter) => {
                // The timer may be the caller; don't abort it mid-run.
                waiter.timer.take();
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("request {} timed out", request_id);
                waiter.resolve(RequestOutcome::TimedOut);
                true
            }
            None => false,
        }
    }

    /// Arms a timer that expires `request_id` after `timeout`.
    ///
    /// The timer is disarmed when the entry completes or is cancelled first.
    /// Returns false if there is no such entry or no Tokio runtime to run
    /// the timer on.
    pub fn cancel_on_timeout(self: &Arc<Self>, request_id: u16, timeout: Duration) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no runtime available to time out request {}", request_id);
            return false;
        };

        let mut inner = self.inner.lock();
        let Some(waiter) = inner.entries.get_mut(&request_id) else {
            return false;
        };

        let table = Arc::downgrade(self);
        let ticket = waiter.ticket;
        let timer = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(table) = table.upgrade() {
                table.expire_ticket(request_id, ticket);
            }
        });

        if let Some(previous) = waiter.timer.replace(timer) {
            previous.abort();
        }
        true
    }

    /// Resolves the waiter for `request_id` as cancelled.
    pub fn cancel(&self, request_id: u16) -> bool {
        let waiter = self.inner.lock().entries.remove(&request_id);
        match waiter {
            Some(waiter) => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                waiter.resolve(RequestOutcome::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Cancels every request issued on `conn`.
    pub fn cancel_connection(&self, conn: ConnectionKey) -> usize {
        let waiters: Vec<Waiter> = {
            let mut inner = self.inner.lock();
            let ids: Vec<u16> = inner
                .entries
                .iter()
                .filter(|(_, w)| w.conn == conn)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| inner.entries.remove(id))
                .collect()
        };

        let count = waiters.len();
        for waiter in waiters {
            waiter.resolve(RequestOutcome::Cancelled);
        }
        if count > 0 {
            self.counters
                .cancelled
                .fetch_add(count as u64, Ordering::Relaxed);
            tracing::debug!("cancelled {} pending requests on {}", count, conn);
        }
        count
    }

    pub fn contains(&self, request_id: u16) -> bool {
        self.inner.lock().entries.contains_key(&request_id)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn stats(&self) -> PendingStats {
        PendingStats {
            registered: self.counters.registered.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}

/// Caller side of a registered request.
#[derive(Debug)]
pub struct PendingResponse {
    request_id: u16,
    rx: oneshot::Receiver<RequestOutcome>,
}

impl PendingResponse {
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    /// Waits for the request to end.
    pub async fn wait(self) -> RequestOutcome {
        self.rx.await.unwrap_or(RequestOutcome::Cancelled)
    }

    /// Returns the outcome if the request has already ended.
    pub fn try_outcome(&mut self) -> Option<RequestOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(RequestOutcome::Cancelled),
        }
    }
}
