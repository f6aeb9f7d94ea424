//! The transport façade: the one interface the coordination core uses to
//! move opaque byte buffers between processes.
//!
//! The core never serializes or interprets payloads here — it only calls
//! [`Transport::send`], [`Transport::bcast`] and [`Transport::bcast_subset`]
//! to hand buffers to the façade, and drains arrivals with
//! [`Transport::try_recv`]. Everything about *who* a buffer is ultimately
//! for is handled one layer up, by [`crate::dispatch::Switchboard`].
pub trait Transport {
    /// This process's index among its peers, in `0 .. peers()`.
    fn index(&self) -> usize;
    /// The number of processes participating in the computation.
    fn peers(&self) -> usize;

    /// Enqueues `buf` for delivery to process `dst`. May return before the
    /// buffer is actually on the wire; see [`Transport::step`].
    fn send(&mut self, dst: usize, buf: Vec<u8>);

    /// Enqueues `buf` for delivery to every peer other than this process.
    fn bcast(&mut self, buf: Vec<u8>) {
        let targets: Vec<usize> = (0..self.peers()).filter(|&p| p != self.index()).collect();
        self.bcast_subset(buf, &targets);
    }

    /// Enqueues `buf` for delivery to exactly the processes named in `dsts`.
    fn bcast_subset(&mut self, buf: Vec<u8>, dsts: &[usize]) {
        for &dst in dsts {
            self.send(dst, buf.clone());
        }
    }

    /// Removes and returns one arrived buffer, if any is available without
    /// blocking.
    fn try_recv(&mut self) -> Option<Vec<u8>>;

    /// Gives the transport a chance to push outbound buffers and pull in
    /// inbound bytes from the underlying channel/socket. Allocators that do
    /// this eagerly on `send`/`try_recv` may leave this empty.
    fn step(&mut self) {}

    /// The number of buffers sent minus the number received, as observed by
    /// this process. Used by the quiescence protocol (§4.3) to decide
    /// whether distributed traffic has drained.
    fn outstanding(&self) -> i64 { 0 }
}
