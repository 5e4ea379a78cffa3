//! Min-heap over cached entities, ordered by last-access stamp.
//!
//! Entities record their own heap slot, so fixing an entry after a recency
//! bump is a direct sift instead of a scan. The heap never locks; callers
//! serialize access with their own mutex.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{Cached, NO_SLOT};

pub(crate) struct AccessHeap<T: Cached + ?Sized> {
    entries: Vec<Arc<T>>,
}

impl<T: Cached + ?Sized> AccessHeap<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Least-recently-accessed entity, if any.
    pub fn peek(&self) -> Option<&Arc<T>> {
        self.entries.first()
    }

    pub fn push(&mut self, entity: Arc<T>) {
        let slot = self.entries.len();
        entity.heap_slot().store(slot, Ordering::Relaxed);
        self.entries.push(entity);
        self.sift_up(slot);
    }

    /// Remove and return the least-recently-accessed entity.
    pub fn pop(&mut self) -> Option<Arc<T>> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.remove_at(0))
    }

    /// Restore heap order around an entity whose stamp changed.
    pub fn fix(&mut self, entity: &T) {
        let slot = entity.heap_slot().load(Ordering::Relaxed);
        if slot >= self.entries.len() {
            return;
        }
        let slot = self.sift_down(slot);
        self.sift_up(slot);
    }

    /// Remove an entity wherever it sits in the heap.
    pub fn remove(&mut self, entity: &T) -> Option<Arc<T>> {
        let slot = entity.heap_slot().load(Ordering::Relaxed);
        if slot >= self.entries.len() || self.entries[slot].cache_id() != entity.cache_id() {
            return None;
        }
        Some(self.remove_at(slot))
    }

    fn remove_at(&mut self, slot: usize) -> Arc<T> {
        let last = self.entries.len() - 1;
        self.entries.swap(slot, last);
        let removed = self.entries.pop().expect("slot bounds checked");
        removed.heap_slot().store(NO_SLOT, Ordering::Relaxed);

        if slot < self.entries.len() {
            self.entries[slot].heap_slot().store(slot, Ordering::Relaxed);
            let slot = self.sift_down(slot);
            self.sift_up(slot);
        }
        removed
    }

    fn sift_up(&mut self, mut slot: usize) -> usize {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.entries[slot].call_time() >= self.entries[parent].call_time() {
                break;
            }
            self.swap_slots(slot, parent);
            slot = parent;
        }
        slot
    }

    fn sift_down(&mut self, mut slot: usize) -> usize {
        loop {
            let left = slot * 2 + 1;
            if left >= self.entries.len() {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < self.entries.len()
                && self.entries[right].call_time() < self.entries[left].call_time()
            {
                smallest = right;
            }
            if self.entries[slot].call_time() <= self.entries[smallest].call_time() {
                break;
            }
            self.swap_slots(slot, smallest);
            slot = smallest;
        }
        slot
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.entries[a].heap_slot().store(a, Ordering::Relaxed);
        self.entries[b].heap_slot().store(b, Ordering::Relaxed);
    }
}
