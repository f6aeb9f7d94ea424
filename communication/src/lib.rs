//! Transport façade for the coordination core: opaque-buffer messaging over
//! a loopback queue, intra-process `mpsc` channels, or plain TCP sockets,
//! plus the id-addressed dispatch layer built on top of it.
//!
//! [`transport::Transport`] collapses allocate/push/pull style channel
//! traits into one opaque-byte-buffer interface, since the core never needs
//! typed per-channel allocation, only "send this component's encoded
//! message to that pid".

pub mod dispatch;
pub mod generic;
pub mod initialize;
pub mod process;
pub mod tcp;
pub mod thread;
pub mod transport;

pub use dispatch::{Distributable, Switchboard};
pub use generic::Generic;
pub use initialize::{initialize, initialize_from, Configuration, WorkerGuards};
pub use transport::Transport;
