//! Inter-thread, intra-process transport: one OS process hosting several
//! worker threads, connected by `mpsc` channels.
//!
//! A single builder call allocates one channel per ordered pair of peers up
//! front, and each resulting [`Process`] owns the sending half to every peer
//! (including itself, for uniformity) and the receiving half of its own
//! inbox.

use std::sync::mpsc::{channel, Receiver, Sender};

use crate::transport::Transport;

/// A transport endpoint for one worker thread within a multi-threaded,
/// single-process computation.
pub struct Process {
    index: usize,
    peers: usize,
    senders: Vec<Sender<Vec<u8>>>,
    receiver: Receiver<Vec<u8>>,
    sent: i64,
    received: i64,
}

impl Process {
    /// Allocates a fully-connected group of `peers` intra-process endpoints.
    pub fn new_vector(peers: usize) -> Vec<Process> {
        let mut senders = Vec::with_capacity(peers);
        let mut receivers = Vec::with_capacity(peers);
        for _ in 0..peers {
            let (send, recv) = channel();
            senders.push(send);
            receivers.push(recv);
        }

        receivers
            .into_iter()
            .enumerate()
            .map(|(index, receiver)| Process {
                index,
                peers,
                senders: senders.clone(),
                receiver,
                sent: 0,
                received: 0,
            })
            .collect()
    }
}

impl Transport for Process {
    fn index(&self) -> usize { self.index }
    fn peers(&self) -> usize { self.peers }

    fn send(&mut self, dst: usize, buf: Vec<u8>) {
        self.sent += 1;
        self.senders[dst]
            .send(buf)
            .expect("peer worker thread hung up: its Process endpoint was dropped");
    }

    fn try_recv(&mut self) -> Option<Vec<u8>> {
        let result = self.receiver.try_recv().ok();
        if result.is_some() { self.received += 1; }
        result
    }

    fn outstanding(&self) -> i64 { self.sent - self.received }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn peers_exchange_messages() {
        let mut group = Process::new_vector(3);
        let mut p2 = group.pop().unwrap();
        let mut p1 = group.pop().unwrap();
        let mut p0 = group.pop().unwrap();

        p0.send(1, vec![9]);
        p0.send(2, vec![8]);

        let h1 = thread::spawn(move || {
            loop {
                if let Some(buf) = p1.try_recv() { return buf; }
            }
        });
        let h2 = thread::spawn(move || {
            loop {
                if let Some(buf) = p2.try_recv() { return buf; }
            }
        });

        assert_eq!(h1.join().unwrap(), vec![9]);
        assert_eq!(h2.join().unwrap(), vec![8]);
        assert_eq!(p0.outstanding(), 2);
    }
}
