//! The item cell: the unit of storage in an item collection (§3 "Item
//! cell"). One [`ItemCell`] sits behind a per-tag mutex in an
//! [`crate::item::table::ItemTable`]; all of the invariants in §3 ("value
//! present ⇒ suspend_group empty", etc.) are maintained by
//! [`crate::item::collection::ItemCollection`] while it holds that mutex,
//! never by `ItemCell` itself reaching for a lock of its own.

use std::sync::Arc;

use crate::step::SuspendGroup;

/// `get_count`'s three-way state (§3): unresolved, permanently untracked,
/// or a concrete non-negative-when-owned counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GetCountState {
    /// Not yet assigned; assigned on the first `put` or remote delivery.
    Unset,
    /// Never collected.
    NoGetCount,
    /// A tracked counter. Negative values are valid only on a non-owner,
    /// where they record opportunistic local decrements not yet flushed
    /// to the owner (§4.1 "Local GC algorithm").
    Value(i64),
}

/// Per-cell metadata, distinct from the payload itself so that erasure can
/// drop the payload while still answering "was this ever owned here".
pub struct ItemProperties {
    pub get_count: GetCountState,
    /// The process responsible for this item's lifecycle; `None` until
    /// resolved.
    pub owner_pid: Option<usize>,
    /// Whether this process allocated the payload, versus having received
    /// it over the wire (governs the cleanup path on erasure, §5
    /// "Memory").
    pub am_creator: bool,
    /// Remote processes that requested this item before it arrived
    /// locally; only ever populated on a non-owner (§3 invariants).
    pub subscribers: Option<Vec<usize>>,
}

impl ItemProperties {
    pub fn new() -> Self {
        ItemProperties { get_count: GetCountState::Unset, owner_pid: None, am_creator: true, subscribers: None }
    }

    pub fn am_owner(&self, my_pid: usize) -> bool { self.owner_pid == Some(my_pid) }
    pub fn has_owner(&self) -> bool { self.owner_pid.is_some() }
}

impl Default for ItemProperties {
    fn default() -> Self { ItemProperties::new() }
}

/// One tag's slot in an item collection's table.
pub struct ItemCell<V> {
    pub value: Option<Arc<V>>,
    pub props: ItemProperties,
    pub suspend_group: Option<SuspendGroup>,
}

impl<V> ItemCell<V> {
    pub fn empty() -> Self {
        ItemCell { value: None, props: ItemProperties::new(), suspend_group: None }
    }

    /// §3 invariant: a present value implies no one is waiting on it.
    pub fn check_invariant(&self) {
        let suspend_empty = match &self.suspend_group {
            None => true,
            Some(group) => group.is_empty(),
        };
        debug_assert!(
            self.value.is_none() || suspend_empty,
            "item cell invariant violated: value present with a non-empty suspend group"
        );
    }
}
