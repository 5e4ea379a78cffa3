//! Cached entity stores: a node tree and a component catalog sharing one
//! residency protocol (activation from the repository, LRU eviction by last
//! access, dirty write-back on deactivation).

mod component;
mod heap;
mod node;
mod residency;

pub use component::ComponentStore;
pub use node::{Node, NodeStore};

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Process-wide monotonic access clock. Strictly increasing, so two accesses
/// never tie and heap order is total.
static ACCESS_CLOCK: AtomicU64 = AtomicU64::new(1);

pub(crate) fn access_tick() -> u64 {
    ACCESS_CLOCK.fetch_add(1, Ordering::Relaxed)
}

/// Sentinel for an entity that is not currently in the access heap.
pub(crate) const NO_SLOT: usize = usize::MAX;

/// Recover the kind prefix encoded in an entity id. Ids are
/// `<kind>-<uuidv4>`, which splits into exactly six dash-separated segments.
pub(crate) fn kind_of_id(id: &str) -> crate::types::Result<&str> {
    let mut segments = id.split('-');
    let prefix = segments
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| crate::types::GroveError::Invariant(format!("provided id {id} is not valid")))?;
    if segments.count() != 5 {
        return Err(crate::types::GroveError::Invariant(format!(
            "provided id {id} is not valid"
        )));
    }
    Ok(prefix)
}

/// An entity that can live in a residency cache: it carries its own
/// last-access stamp and its slot in the access heap, so a recency fix is
/// O(log n) without a search.
pub trait Cached: Send + Sync {
    fn cache_id(&self) -> &str;

    /// Last-access stamp, from [`access_tick`].
    fn call_time(&self) -> u64;

    /// Stamp a fresh access.
    fn touch(&self);

    /// Current position in the access heap; `NO_SLOT` when absent.
    fn heap_slot(&self) -> &AtomicUsize;

    /// Whether the in-memory state differs from the repository copy.
    fn is_dirty(&self) -> bool {
        false
    }
}
