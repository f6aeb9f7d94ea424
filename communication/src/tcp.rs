//! Inter-process transport over plain TCP sockets.
//!
//! Lower-indexed processes connect out to every higher-indexed process first
//! (`start_connections`), while each process simultaneously listens for the
//! connections coming from below (`await_connections`); the first 8 bytes
//! on a freshly accepted socket identify the connecting peer. Frames are
//! length-prefixed (a 4-byte little-endian length followed by that many
//! body bytes), since this transport only ever carries the core's
//! already-encoded opaque buffers.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::sleep;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::transport::Transport;

const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Connects to every peer named in `addresses`: this process dials every
/// lower-indexed peer and accepts a connection from every higher-indexed
/// one.
pub fn connect(addresses: &[String], my_index: usize) -> io::Result<Vec<TcpStream>> {
    let lower = start_connections(addresses, my_index)?;
    let upper = await_connections(addresses, my_index)?;

    let mut sockets = Vec::with_capacity(addresses.len());
    let mut lower = lower.into_iter();
    let mut upper = upper.into_iter();
    for index in 0..addresses.len() {
        if index < my_index {
            sockets.push(lower.next().expect("one connection per lower peer"));
        } else if index > my_index {
            sockets.push(upper.next().expect("one connection per upper peer"));
        }
    }
    Ok(sockets)
}

fn start_connections(addresses: &[String], my_index: usize) -> io::Result<Vec<TcpStream>> {
    let mut results = Vec::with_capacity(my_index);
    for index in 0..my_index {
        loop {
            match TcpStream::connect(&addresses[index]) {
                Ok(mut stream) => {
                    stream.set_nodelay(true)?;
                    stream.write_u64::<LittleEndian>(my_index as u64)?;
                    results.push(stream);
                    break;
                }
                Err(_) => sleep(RETRY_INTERVAL),
            }
        }
    }
    Ok(results)
}

fn await_connections(addresses: &[String], my_index: usize) -> io::Result<Vec<TcpStream>> {
    let expected = addresses.len() - my_index - 1;
    let listener = TcpListener::bind(&addresses[my_index])?;
    let mut by_index = vec![None; expected];
    for _ in 0..expected {
        let (mut stream, _) = listener.accept()?;
        stream.set_nodelay(true)?;
        let peer_index = stream.read_u64::<LittleEndian>()? as usize;
        by_index[peer_index - my_index - 1] = Some(stream);
    }
    Ok(by_index.into_iter().map(|s| s.expect("every upper peer connects exactly once")).collect())
}

/// A process-to-process transport backed by one TCP connection per peer.
///
/// Every connection runs a dedicated reader thread that deframes inbound
/// buffers and forwards them to a shared inbox; writes happen directly on
/// the caller's thread behind a per-peer mutex.
pub struct Tcp {
    index: usize,
    peers: usize,
    writers: Vec<Option<Arc<Mutex<TcpStream>>>>,
    inbox: Receiver<Vec<u8>>,
    sent: i64,
    received: i64,
}

impl Tcp {
    /// Builds a transport from already-connected sockets, one per peer
    /// ordered `0 .. peers` with a `None` slot for `my_index` itself.
    pub fn new(my_index: usize, peers: usize, sockets: Vec<TcpStream>) -> Self {
        assert_eq!(sockets.len(), peers - 1, "expected one socket per remote peer");

        let (tx, rx) = channel();
        let mut writers = Vec::with_capacity(peers);
        let mut sockets = sockets.into_iter();
        for index in 0..peers {
            if index == my_index {
                writers.push(None);
                continue;
            }
            let stream = sockets.next().expect("one socket per remote peer");
            let reader_stream = stream.try_clone().expect("TCP stream clone for reader thread");
            let tx = tx.clone();
            thread::Builder::new()
                .name(format!("cnc-tcp-reader-{}", index))
                .spawn(move || read_loop(reader_stream, tx))
                .expect("failed to spawn TCP reader thread");
            writers.push(Some(Arc::new(Mutex::new(stream))));
        }

        Tcp { index: my_index, peers, writers, inbox: rx, sent: 0, received: 0 }
    }
}

fn read_loop(mut stream: TcpStream, tx: Sender<Vec<u8>>) {
    loop {
        let len = match stream.read_u32::<LittleEndian>() {
            Ok(len) => len as usize,
            Err(_) => return, // peer closed the connection; nothing more to deliver.
        };
        let mut body = vec![0u8; len];
        if stream.read_exact(&mut body).is_err() { return; }
        if tx.send(body).is_err() { return; }
    }
}

impl Transport for Tcp {
    fn index(&self) -> usize { self.index }
    fn peers(&self) -> usize { self.peers }

    fn send(&mut self, dst: usize, buf: Vec<u8>) {
        assert_ne!(dst, self.index, "a process never sends itself a wire message");
        self.sent += 1;
        let writer = self.writers[dst]
            .as_ref()
            .expect("writer socket missing for a registered peer")
            .clone();
        let mut stream = writer.lock().expect("TCP writer mutex poisoned");
        stream
            .write_u32::<LittleEndian>(buf.len() as u32)
            .and_then(|()| stream.write_all(&buf))
            .expect("TCP write failed; the transport has no recovery path for a dead peer");
    }

    fn try_recv(&mut self) -> Option<Vec<u8>> {
        let result = self.inbox.try_recv().ok();
        if result.is_some() { self.received += 1; }
        result
    }

    fn outstanding(&self) -> i64 { self.sent - self.received }
}
