//! Dispatch of inbound buffers to a registered *distributable* by id.
//!
//! The transport façade itself only knows about opaque buffers; something
//! above it has to know which buffer belongs to which component (an item
//! collection, a reduction graph, the scheduler's quiescence protocol). A
//! [`Switchboard`] is that something: every outbound buffer is prefixed with
//! the sender's idea of which [`Distributable`] it's destined for, and every
//! inbound buffer's prefix is stripped and used to look up the matching
//! locally-registered handler.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use cnc_bytes::{Decoder, Encoder};

use crate::transport::Transport;

/// A capability object a component registers with the switchboard so that
/// buffers addressed to its id are routed to it.
///
/// Components typically implement this on a thin wrapper around an
/// `Rc<RefCell<...>>` they also hold directly, so that both the switchboard
/// and ordinary API calls (`put`/`get`, reduction `on_put`, ...) reach the
/// same shared state.
///
/// Bound `Send + Sync` so a [`Switchboard`] can be shared across a process's
/// worker pool behind a single mutex (§5 "Per-owner serializers for
/// distributed GC are guarded by one mutex per item collection" generalizes
/// to the whole switchboard): registration happens once per component, but
/// dispatch may run on whichever worker thread happens to poll the
/// transport, and `Arc<dyn Distributable>` itself must be `Send` to live
/// inside a `Mutex<Switchboard<_>>` shared via `Arc<Node>` — which requires
/// the pointee to be both `Send` and `Sync`.
pub trait Distributable: Send + Sync {
    /// The id this component was registered under.
    fn id(&self) -> usize;
    /// Handles one inbound buffer addressed to this component.
    fn recv(&self, payload: &[u8]);
}

/// Routes outbound buffers to the transport with an id prefix, and routes
/// inbound buffers to registered [`Distributable`]s by that same prefix.
pub struct Switchboard<T: Transport> {
    transport: T,
    handlers: RefCell<HashMap<usize, Arc<dyn Distributable>>>,
}

impl<T: Transport> Switchboard<T> {
    /// Wraps a transport for id-addressed dispatch.
    pub fn new(transport: T) -> Self {
        Switchboard { transport, handlers: RefCell::new(HashMap::new()) }
    }

    /// This process's index.
    pub fn index(&self) -> usize { self.transport.index() }
    /// The number of processes.
    pub fn peers(&self) -> usize { self.transport.peers() }

    /// Registers a component to receive buffers addressed to its id.
    ///
    /// Overwrites any previous registration under the same id: callers are
    /// expected to register exactly once per id, at collection/graph
    /// construction time. Handlers are held behind `Arc` rather than `Box`
    /// so [`Switchboard::drain`] can clone one out and release the handler
    /// map's borrow before the caller invokes `recv` on it.
    pub fn register(&self, handler: Arc<dyn Distributable>) {
        self.handlers.borrow_mut().insert(handler.id(), handler);
    }

    /// Deregisters a component, e.g. on collection teardown.
    pub fn unregister(&self, id: usize) {
        self.handlers.borrow_mut().remove(&id);
    }

    /// Sends `body` to process `dst`, addressed to component `id`.
    pub fn send(&mut self, id: usize, dst: usize, body: &[u8]) {
        self.transport.send(dst, Self::frame(id, body));
    }

    /// Broadcasts `body` to every other process, addressed to component `id`.
    pub fn bcast(&mut self, id: usize, body: &[u8]) {
        self.transport.bcast(Self::frame(id, body));
    }

    /// Sends `body` to exactly the processes in `dsts`, addressed to `id`.
    pub fn bcast_subset(&mut self, id: usize, body: &[u8], dsts: &[usize]) {
        self.transport.bcast_subset(Self::frame(id, body), dsts);
    }

    fn frame(id: usize, body: &[u8]) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u32(id as u32);
        enc.write_bytes(body);
        enc.into_vec()
    }

    /// Drains every buffer currently available from the transport and pairs
    /// each with a clone of its registered handler, without calling `recv`.
    ///
    /// Splitting drain from dispatch lets a caller that holds this
    /// switchboard behind its own lock (e.g. a `Node` wrapping it in a
    /// `Mutex` for cross-thread sharing, §5) release that lock before
    /// invoking `recv`. Without the split, a handler whose `recv` sends a
    /// reply through the same `Node` would dead-lock retaking a lock its
    /// own call stack already holds. Buffers addressed to an id with no
    /// registered handler are dropped with a warning: per the core's error
    /// model, an unroutable message indicates a closed, fully-enumerated
    /// protocol was violated, not a recoverable condition.
    pub fn drain(&mut self) -> Vec<(Arc<dyn Distributable>, Vec<u8>)> {
        self.transport.step();
        let mut out = Vec::new();
        while let Some(buf) = self.transport.try_recv() {
            let mut dec = Decoder::new(&buf);
            let id = dec.read_u32() as usize;
            let rest = dec.read_bytes(dec.remaining()).to_vec();
            match self.handlers.borrow().get(&id) {
                Some(handler) => out.push((handler.clone(), rest)),
                None => eprintln!("cnc: dropping message for unregistered distributable id {id}"),
            }
        }
        out
    }

    /// Drains and dispatches in one call, for callers not sharing this
    /// switchboard across threads (tests, single-threaded transports).
    pub fn poll(&mut self) {
        for (handler, payload) in self.drain() {
            handler.recv(&payload);
        }
    }

    /// The number of buffers sent minus received, per [`Transport::outstanding`].
    pub fn outstanding(&self) -> i64 { self.transport.outstanding() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::Thread;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Recorder {
        id: usize,
        seen: Arc<AtomicU32>,
    }

    impl Distributable for Recorder {
        fn id(&self) -> usize { self.id }
        fn recv(&self, payload: &[u8]) {
            let mut dec = Decoder::new(payload);
            self.seen.store(dec.read_u32(), Ordering::SeqCst);
        }
    }

    #[test]
    fn routes_by_registered_id() {
        let mut board = Switchboard::new(Thread::new());
        let seen = Arc::new(AtomicU32::new(0));
        board.register(Arc::new(Recorder { id: 7, seen: seen.clone() }));

        let mut body = Encoder::new();
        body.write_u32(99);
        board.send(7, 0, &body.into_vec());
        board.poll();

        assert_eq!(seen.load(Ordering::SeqCst), 99);
    }
}
