//! Priority ordering of runnable requests.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::handle::HandleId;

/// Heap entry. Smallest remaining work first, earlier arrival on ties.
#[derive(Debug)]
struct ReadyEntry {
    priority: u64,
    id: HandleId,
    generation: u64,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: invert so the smallest key pops first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.id.cmp(&self.id))
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

/// Requests that have work to dispatch, keyed by remaining workload.
///
/// Re-inserting a member re-keys it; superseded heap entries are skipped on
/// pop instead of being removed eagerly.
#[derive(Debug, Default)]
pub struct ReadySet {
    heap: BinaryHeap<ReadyEntry>,
    live: HashMap<HandleId, u64>,
    generation: u64,
}

impl ReadySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id`, or move it to `priority` if already present.
    pub fn insert(&mut self, id: HandleId, priority: u64) {
        self.generation += 1;
        self.live.insert(id, self.generation);
        self.heap.push(ReadyEntry { priority, id, generation: self.generation });
    }

    pub fn remove(&mut self, id: HandleId) -> bool {
        self.live.remove(&id).is_some()
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.live.contains_key(&id)
    }

    /// Take the member with the least remaining work.
    pub fn pop(&mut self) -> Option<HandleId> {
        while let Some(entry) = self.heap.pop() {
            if self.live.get(&entry.id) == Some(&entry.generation) {
                self.live.remove(&entry.id);
                return Some(entry.id);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
