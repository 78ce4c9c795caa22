///! Bounded dedup set for per-member feeds
///!
///! Ids within one feed are near-monotonic, so when the set overflows the
///! smallest ids are the safest to forget: anything new will exceed them.

use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct SeenIdSet {
    ids: BTreeSet<i64>,
    capacity: usize,
}

impl SeenIdSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: BTreeSet::new(),
            capacity,
        }
    }

    pub fn from_ids(ids: impl IntoIterator<Item = i64>, capacity: usize) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            capacity,
        }
    }

    /// Adds unconditionally; trimming is a separate, explicit step.
    pub fn insert(&mut self, id: i64) -> bool {
        self.ids.insert(id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    /// Evict smallest ids until the set fits its capacity. Returns the number
    /// of evicted ids.
    pub fn trim(&mut self) -> usize {
        let mut removed = 0;
        while self.ids.len() > self.capacity {
            self.ids.pop_first();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ascending snapshot for persistence.
    pub fn sorted_ids(&self) -> Vec<i64> {
        self.ids.iter().copied().collect()
    }
}
