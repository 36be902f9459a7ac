//! Per-step join restoring fire order over out-of-order completions.

use std::collections::BTreeMap;

/// Releases results strictly in ordinal order.
///
/// Every fired ordinal must eventually be filled, with `Some(value)` for a
/// completed invocation or `None` for one that failed or was cancelled, so a
/// missing result never stalls later ones.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, Option<T>>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Start releasing at `next`; earlier ordinals were released before a
    /// restart.
    pub fn starting_at(next: u64) -> Self {
        Self {
            next,
            pending: BTreeMap::new(),
        }
    }

    pub fn next_ordinal(&self) -> u64 {
        self.next
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Fill `ordinal` and return every result that is now releasable, in
    /// order. Ordinals below the release point are ignored.
    pub fn insert(&mut self, ordinal: u64, value: Option<T>) -> Vec<(u64, Option<T>)> {
        if ordinal < self.next {
            return Vec::new();
        }
        self.pending.insert(ordinal, value);

        let mut released = Vec::new();
        while let Some(value) = self.pending.remove(&self.next) {
            released.push((self.next, value));
            self.next += 1;
        }
        released
    }
}
