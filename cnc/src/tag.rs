//! The `Tag`/`Value` bounds the core requires of user-supplied types.
//!
//! Hashing, equality and cheap copies are the user's job (§3's "user-defined
//! Tag" data model entry); the only thing the core itself adds is the
//! [`cnc_bytes::Codec`] bound, since a tag or a value may need to cross the
//! wire in distributed mode. Single-process computations never touch the
//! codec path at all.

use std::fmt::Debug;
use std::hash::Hash;

use cnc_bytes::Codec;

/// A key identifying one instance of a step or item within its collection.
///
/// Blanket-implemented for any type meeting the bounds; there is nothing to
/// implement by hand beyond deriving the usual traits.
pub trait Tag: Clone + Eq + Hash + Debug + Codec + Send + Sync + 'static {}
impl<T: Clone + Eq + Hash + Debug + Codec + Send + Sync + 'static> Tag for T {}

/// A payload stored in an item collection.
///
/// Values are cloned across the API boundary when user code retains a
/// handle past a cell's erasure (§5 "Memory"); callers are expected to wrap
/// expensive payloads in their own `Arc` if clone cost matters, since the
/// bound itself leaves sharing strategy up to the user.
pub trait Value: Clone + Debug + Codec + Send + Sync + 'static {}
impl<T: Clone + Debug + Codec + Send + Sync + 'static> Value for T {}
