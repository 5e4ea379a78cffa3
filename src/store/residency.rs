//! Shared residency tracking for cached entity stores.
//!
//! Membership lives in a concurrent map; recency lives in an access heap
//! behind its own mutex. The two are deliberately not folded under one lock:
//! read-heavy workloads would otherwise serialize on heap contention. The
//! heap mutex is held only for heap bookkeeping, never across a repository
//! call.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::heap::AccessHeap;
use super::Cached;

/// Result of a membership probe.
pub(crate) enum Lookup<T: ?Sized> {
    /// Entity is active.
    Resident(Arc<T>),
    /// A placeholder is present: another caller is mid-activation.
    Activating,
    Absent,
}

/// Two-tier residency state: `None` map entries are activation placeholders,
/// claimed atomically so exactly one caller loads from the repository.
pub(crate) struct Residency<T: Cached + ?Sized> {
    cache: DashMap<String, Option<Arc<T>>>,
    heap: Mutex<AccessHeap<T>>,
    capacity: usize,
}

impl<T: Cached + ?Sized> Residency<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: DashMap::new(),
            heap: Mutex::new(AccessHeap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn lookup(&self, id: &str) -> Lookup<T> {
        match self.cache.get(id) {
            Some(slot) => match slot.value() {
                Some(entity) => Lookup::Resident(entity.clone()),
                None => Lookup::Activating,
            },
            None => Lookup::Absent,
        }
    }

    /// Claim the right to activate `id`. Returns false when the entity is
    /// already active or another caller holds the claim.
    pub fn claim(&self, id: &str) -> bool {
        match self.cache.entry(id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(None);
                true
            }
        }
    }

    /// Release a claim after a failed activation.
    pub fn abort_claim(&self, id: &str) {
        self.cache.remove_if(id, |_, slot| slot.is_none());
    }

    /// Replace the claim placeholder with the activated entity.
    pub fn commit(&self, entity: Arc<T>) {
        self.cache
            .insert(entity.cache_id().to_string(), Some(entity.clone()));
        self.heap.lock().expect("heap lock").push(entity);
    }

    /// Restore heap order after an entity's access stamp changed.
    pub fn fix(&self, entity: &T) {
        self.heap.lock().expect("heap lock").fix(entity);
    }

    /// Remove an active entity from the map, leaving it in the heap. Returns
    /// `None` when the entity is absent or only a placeholder is present.
    pub fn take(&self, id: &str) -> Option<Arc<T>> {
        let (_, slot) = self.cache.remove_if(id, |_, slot| slot.is_some())?;
        slot
    }

    /// Reinsert into the map only (rollback for a failed deactivation, where
    /// the entity never left the heap).
    pub fn restore_map_only(&self, entity: Arc<T>) {
        self.cache
            .insert(entity.cache_id().to_string(), Some(entity));
    }

    /// Reinsert into both tiers (rollback for a failed eviction).
    pub fn restore(&self, entity: Arc<T>) {
        debug!(id = entity.cache_id(), "eviction rolled back");
        self.commit(entity);
    }

    pub fn drop_from_heap(&self, entity: &T) {
        self.heap.lock().expect("heap lock").remove(entity);
    }

    /// Pop the least-recently-used entity out of both tiers, when the heap
    /// holds more than `target` entries.
    pub fn evict_lru(&self, target: usize) -> Option<Arc<T>> {
        let mut heap = self.heap.lock().expect("heap lock");
        if heap.len() <= target {
            return None;
        }
        let entity = heap.pop()?;
        self.cache.remove(entity.cache_id());
        Some(entity)
    }

    /// Shrink target: half the capacity, clamped to at least one entry.
    pub fn shrink_target(&self) -> usize {
        (self.capacity / 2).max(1)
    }

    pub fn over_capacity(&self) -> bool {
        self.active_count() > self.capacity
    }

    pub fn active_count(&self) -> usize {
        self.heap.lock().expect("heap lock").len()
    }

    /// Id of the least-recently-used resident entity.
    pub fn least_recent_id(&self) -> Option<String> {
        self.heap
            .lock()
            .expect("heap lock")
            .peek()
            .map(|e| e.cache_id().to_string())
    }

    pub fn is_resident(&self, id: &str) -> bool {
        matches!(self.lookup(id), Lookup::Resident(_))
    }
}
