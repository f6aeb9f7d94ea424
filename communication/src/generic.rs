//! A generic transport, wrapping the known implementors of [`Transport`].
//!
//! Useful anywhere it's inconvenient to stay generic over `T: Transport`
//! (closures whose captured type must be nameable).

use crate::process::Process;
use crate::tcp::Tcp;
use crate::thread::Thread;
use crate::transport::Transport;

/// Enumerates the transports this crate knows how to build, and forwards
/// `Transport` calls to whichever is active.
pub enum Generic {
    /// Single-process, single-worker loopback.
    Thread(Thread),
    /// Multiple worker threads within one OS process.
    Process(Process),
    /// Multiple OS processes, connected over TCP.
    Tcp(Tcp),
}

impl Transport for Generic {
    fn index(&self) -> usize {
        match self {
            Generic::Thread(t) => t.index(),
            Generic::Process(p) => p.index(),
            Generic::Tcp(z) => z.index(),
        }
    }
    fn peers(&self) -> usize {
        match self {
            Generic::Thread(t) => t.peers(),
            Generic::Process(p) => p.peers(),
            Generic::Tcp(z) => z.peers(),
        }
    }
    fn send(&mut self, dst: usize, buf: Vec<u8>) {
        match self {
            Generic::Thread(t) => t.send(dst, buf),
            Generic::Process(p) => p.send(dst, buf),
            Generic::Tcp(z) => z.send(dst, buf),
        }
    }
    fn bcast_subset(&mut self, buf: Vec<u8>, dsts: &[usize]) {
        match self {
            Generic::Thread(t) => t.bcast_subset(buf, dsts),
            Generic::Process(p) => p.bcast_subset(buf, dsts),
            Generic::Tcp(z) => z.bcast_subset(buf, dsts),
        }
    }
    fn try_recv(&mut self) -> Option<Vec<u8>> {
        match self {
            Generic::Thread(t) => t.try_recv(),
            Generic::Process(p) => p.try_recv(),
            Generic::Tcp(z) => z.try_recv(),
        }
    }
    fn outstanding(&self) -> i64 {
        match self {
            Generic::Thread(t) => t.outstanding(),
            Generic::Process(p) => p.outstanding(),
            Generic::Tcp(z) => z.outstanding(),
        }
    }
}
