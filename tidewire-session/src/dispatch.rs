//! Routing of decoded packets.
//!
//! Responses go to exactly one waiter in the [`PendingRequestTable`].
//! Commands and requests are lent to every handler registered for their
//! command id; the dispatcher drops the packet afterwards, which returns its
//! buffer to the pool.

use crate::pending::PendingRequestTable;
use crate::ConnectionKey;
use dashmap::DashMap;
use std::sync::Arc;
use tidewire_protocol::Packet;

/// Receives packets for the command ids it is registered under.
pub trait FrameHandler: Send + Sync {
    fn handle(&self, conn: ConnectionKey, packet: &Packet);
}

impl<F> FrameHandler for F
where
    F: Fn(ConnectionKey, &Packet) + Send + Sync,
{
    fn handle(&self, conn: ConnectionKey, packet: &Packet) {
        self(conn, packet)
    }
}

/// Where a packet ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivered to the waiting requester.
    Correlated,
    /// A response nobody was waiting for; released.
    UnmatchedResponse,
    /// Lent to this many handlers.
    Delivered(usize),
    /// No handler registered for the command.
    Unhandled,
}

/// Registry of handlers keyed by command id.
#[derive(Default)]
pub struct Dispatcher {
    handlers: DashMap<u16, Vec<Arc<dyn FrameHandler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler for `command`. A command may have several handlers;
    /// they run in registration order.
    pub fn register(&self, command: u16, handler: Arc<dyn FrameHandler>) {
        self.handlers.entry(command).or_default().push(handler);
    }

    /// Removes every handler for `command`, returning how many there were.
    pub fn unregister(&self, command: u16) -> usize {
        self.handlers
            .remove(&command)
            .map(|(_, list)| list.len())
            .unwrap_or(0)
    }

    pub fn handler_count(&self, command: u16) -> usize {
        self.handlers.get(&command).map(|list| list.len()).unwrap_or(0)
    }

    /// Routes `packet` received on `conn`.
    pub fn dispatch(
        &self,
        conn: ConnectionKey,
        packet: Packet,
        pending: &PendingRequestTable,
    ) -> DispatchOutcome {
        if packet.route().is_response() {
            let Some(request_id) = packet.request_id() else {
                return DispatchOutcome::UnmatchedResponse;
            };
            return if pending.complete_from(conn, request_id, packet) {
                DispatchOutcome::Correlated
            } else {
                DispatchOutcome::UnmatchedResponse
            };
        }

        let command = packet.command();
        // Clone the list so handlers may register or unregister while running.
        let handlers = match self.handlers.get(&command) {
            Some(list) if !list.is_empty() => list.clone(),
            _ => {
                tracing::debug!("no handler for command {} from {}", command, conn);
                return DispatchOutcome::Unhandled;
            }
        };

        for handler in &handlers {
            handler.handle(conn, &packet);
        }
        DispatchOutcome::Delivered(handlers.len())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("commands", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tidewire_protocol::{BufferPool, EncryptionMode, Route};

    fn packet(pool: &BufferPool, route: Route, body: &[u8]) -> Packet {
        let mut buf = pool.rent(body.len()).unwrap();
        buf.copy_from_slice(body);
        Packet::new(route, EncryptionMode::NONE, buf, 0)
    }

    #[test]
    fn test_fan_out_to_all_handlers() {
        let pool = BufferPool::default();
        let dispatcher = Dispatcher::new();
        let pending = PendingRequestTable::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            dispatcher.register(
                7,
                Arc::new(move |_conn: ConnectionKey, packet: &Packet| {
                    assert_eq!(packet.payload(), b"ping");
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        let outcome = dispatcher.dispatch(
            ConnectionKey(1),
            packet(&pool, Route::Command { command: 7 }, b"ping"),
            &pending,
        );
        assert_eq!(outcome, DispatchOutcome::Delivered(3));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_unhandled_command_released() {
        let pool = BufferPool::default();
        let dispatcher = Dispatcher::new();
        let outcome = dispatcher.dispatch(
            ConnectionKey(1),
            packet(&pool, Route::Command { command: 99 }, b"x"),
            &PendingRequestTable::new(),
        );
        assert_eq!(outcome, DispatchOutcome::Unhandled);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_response_goes_to_waiter_only() {
        let pool = BufferPool::default();
        let dispatcher = Dispatcher::new();
        let pending = PendingRequestTable::new();
        let listener_hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&listener_hits);
            dispatcher.register(
                3,
                Arc::new(move |_: ConnectionKey, _: &Packet| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        let mut waiter = pending.register(ConnectionKey(1)).unwrap();
        let id = waiter.request_id();
        let route = Route::Response {
            request_id: id,
            command: 3,
        };

        assert_eq!(
            dispatcher.dispatch(ConnectionKey(1), packet(&pool, route, b"ok"), &pending),
            DispatchOutcome::Correlated
        );
        assert_eq!(listener_hits.load(Ordering::SeqCst), 0);
        let response = waiter.try_outcome().unwrap().into_response().unwrap();
        assert_eq!(response.payload(), b"ok");

        assert_eq!(
            dispatcher.dispatch(ConnectionKey(1), packet(&pool, route, b"again"), &pending),
            DispatchOutcome::UnmatchedResponse
        );
        drop(response);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_request_reaches_handler_with_id() {
        let pool = BufferPool::default();
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            dispatcher.register(
                5,
                Arc::new(move |conn: ConnectionKey, packet: &Packet| {
                    seen.lock().push((conn, packet.request_id()));
                }),
            );
        }

        let route = Route::Request {
            command: 5,
            request_id: 12,
        };
        dispatcher.dispatch(
            ConnectionKey(4),
            packet(&pool, route, b"q"),
            &PendingRequestTable::new(),
        );
        assert_eq!(*seen.lock(), vec![(ConnectionKey(4), Some(12))]);
    }

    #[test]
    fn test_unregister() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(1, Arc::new(|_: ConnectionKey, _: &Packet| {}));
        dispatcher.register(1, Arc::new(|_: ConnectionKey, _: &Packet| {}));
        assert_eq!(dispatcher.handler_count(1), 2);
        assert_eq!(dispatcher.unregister(1), 2);
        assert_eq!(dispatcher.handler_count(1), 0);
        assert_eq!(dispatcher.unregister(1), 0);
    }
}
