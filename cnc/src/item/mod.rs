//! The item collection (§4.1): storage, synchronization, local GC and the
//! distributed coherence protocol, built on top of [`cell`]'s per-tag state
//! and [`table`]'s concurrent tag → cell map.

pub mod cell;
pub mod table;
pub mod collection;

pub use collection::{GatherTimeout, GetContext, GetOutcome, ItemCollection};
