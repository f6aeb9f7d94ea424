//! Concurrent tag → item cell mapping (§2's "Item table" component row).
//!
//! A single process-wide map per item collection. The outer `Mutex`
//! protects only the map's *shape* (whether a tag has a cell yet); once a
//! cell exists, callers take its own `Arc<Mutex<ItemCell<V>>>` accessor and
//! never need the outer lock again. This matches §4.1's concurrency
//! contract: acquiring a cell's accessor is a single map lookup followed by
//! a short critical section, never more, and concurrent `put`/`get` on
//! different tags proceed in parallel because they contend on different
//! inner mutexes.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::item::cell::ItemCell;

/// One item collection's tag → cell map.
pub struct ItemTable<T, V> {
    cells: Mutex<HashMap<T, Arc<Mutex<ItemCell<V>>>>>,
}

impl<T: Clone + Eq + Hash, V> ItemTable<T, V> {
    pub fn new() -> Self {
        ItemTable { cells: Mutex::new(HashMap::new()) }
    }

    /// Returns the accessor for `tag`, creating an empty cell on first
    /// reference (§3 "Lifecycle": cells are created lazily by the first
    /// `get` or `put` seeing the tag, or by an incoming remote request).
    pub fn entry(&self, tag: &T) -> Arc<Mutex<ItemCell<V>>> {
        let mut cells = self.cells.lock().expect("item table mutex poisoned");
        cells
            .entry(tag.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ItemCell::empty())))
            .clone()
    }

    /// Returns the accessor for `tag` only if a cell already exists, without
    /// creating one. Used by handlers that must not fabricate state for a
    /// tag nobody has touched yet (e.g. deciding whether to reply `UNAVAIL`).
    pub fn get(&self, tag: &T) -> Option<Arc<Mutex<ItemCell<V>>>> {
        self.cells.lock().expect("item table mutex poisoned").get(tag).cloned()
    }

    /// Drops a cell from the table outright (erasure, or explicit `erase`).
    pub fn remove(&self, tag: &T) {
        self.cells.lock().expect("item table mutex poisoned").remove(tag);
    }

    pub fn len(&self) -> usize {
        self.cells.lock().expect("item table mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every cell (collection reset or teardown, §3 lifecycle).
    pub fn clear(&self) {
        self.cells.lock().expect("item table mutex poisoned").clear();
    }

    /// The current tag set, snapshotted under the map lock. Individual
    /// cells may change state concurrently with iterating this list.
    pub fn tags(&self) -> Vec<T> {
        self.cells.lock().expect("item table mutex poisoned").keys().cloned().collect()
    }

    /// Snapshots every `(tag, value)` pair this process's table currently
    /// holds a value for, regardless of ownership.
    pub fn present_items(&self) -> Vec<(T, Arc<V>)> {
        let cells = self.cells.lock().expect("item table mutex poisoned");
        cells
            .iter()
            .filter_map(|(tag, cell)| {
                let cell = cell.lock().expect("item cell mutex poisoned");
                cell.value.clone().map(|v| (tag.clone(), v))
            })
            .collect()
    }
}

impl<T: Clone + Eq + Hash, V> Default for ItemTable<T, V> {
    fn default() -> Self {
        ItemTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_creates_lazily_and_is_stable() {
        let table: ItemTable<u32, i64> = ItemTable::new();
        assert!(table.get(&1).is_none());
        let a = table.entry(&1);
        let b = table.entry(&1);
        assert!(Arc::ptr_eq(&a, &b), "repeated entry() calls share one cell");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_drops_the_cell() {
        let table: ItemTable<u32, i64> = ItemTable::new();
        table.entry(&1);
        table.remove(&1);
        assert!(table.is_empty());
    }

    #[test]
    fn present_items_reflects_stored_values_only() {
        let table: ItemTable<u32, i64> = ItemTable::new();
        let cell = table.entry(&1);
        table.entry(&2);
        cell.lock().unwrap().value = Some(Arc::new(42));
        let present = table.present_items();
        assert_eq!(present, vec![(1, Arc::new(42))]);
    }
}
