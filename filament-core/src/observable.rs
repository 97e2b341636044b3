//! Observer Edges
//!
//! Every observable node owns the inbound half of the graph: a map from
//! observer node ID to a weak handle on the observing derivation. The
//! outbound half (strong handles from derivation to dependency) lives in
//! each derivation's dependency set, so a node stays alive exactly as long
//! as something external holds it or a live derivation reads it.
//!
//! # Notification Mask
//!
//! Alongside the edge map sits an aggregated mask of invalidation flags
//! already delivered to the whole observer set. A second write to an atom
//! inside one batch finds `DIRTY` already in the mask and stops without
//! walking a single edge. The mask shrinks when a new observer subscribes
//! (it has not seen anything yet) and when a possibly-dirty wave collapses
//! to no-change.
//!
//! # Unobserved Lifecycle
//!
//! A node that asks for it gets a deferred callback when its observer set
//! empties. The callback is queued, not immediate: the observer count may
//! bounce through zero while a drain re-captures dependencies, and only
//! the state at flush time counts.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::node::{Derivation, NodeFlags, NodeId, Observable};
use crate::queue::{self, WorkQueue};

/// The inbound edge set of one observable node.
pub(crate) struct ObserverEdges {
    observers: Mutex<IndexMap<NodeId, Weak<dyn Derivation>>>,
    /// Invalidation flags every current observer has already received.
    mask: AtomicU8,
}

impl ObserverEdges {
    pub(crate) fn new() -> Self {
        Self {
            observers: Mutex::new(IndexMap::new()),
            mask: AtomicU8::new(0),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.observers.lock().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.observers.lock().len()
    }

    pub(crate) fn mask(&self) -> NodeFlags {
        NodeFlags::from_bits_truncate(self.mask.load(Ordering::Relaxed))
    }

    fn insert_mask(&self, flags: NodeFlags) {
        self.mask.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    /// Drop mask bits not present in `keep`.
    pub(crate) fn retain_mask(&self, keep: NodeFlags) {
        self.mask.fetch_and(keep.bits(), Ordering::Relaxed);
    }
}

/// Subscribe `observer` to `observed`.
///
/// The mask is intersected with the flags the new observer already has
/// pending: anything it has not seen must be deliverable again. The first
/// edge into a previously unobserved node fires its observed callback.
pub(crate) fn add_observer(
    observed: &Arc<dyn Observable>,
    id: NodeId,
    observer: Weak<dyn Derivation>,
    pending: NodeFlags,
) {
    let edges = observed.edges();
    let was_empty = {
        let mut map = edges.observers.lock();
        let was_empty = map.is_empty();
        map.insert(id, observer);
        was_empty
    };
    edges.retain_mask(pending);
    if was_empty && !observed.core().contains(NodeFlags::WATCHED) {
        observed.on_observed();
    }
}

/// Drop the edge from `id`, queueing the unobserved callback when the set
/// empties.
pub(crate) fn remove_observer(observed: &Arc<dyn Observable>, id: NodeId) {
    let removed = observed.edges().observers.lock().shift_remove(&id).is_some();
    if removed {
        check_retire(observed);
    }
}

/// Queue the became-unobserved callback if the node wants one and nothing
/// observes it anymore.
pub(crate) fn check_retire(observed: &Arc<dyn Observable>) {
    let core = observed.core();
    if !core.contains(NodeFlags::UNOBSERVED_REQUIRED)
        || core
            .flags()
            .intersects(NodeFlags::UNOBSERVED_PENDING | NodeFlags::WATCHED)
        || !observed.edges().is_empty()
    {
        return;
    }
    core.insert(NodeFlags::UNOBSERVED_PENDING);
    let weak = Arc::downgrade(observed);
    WorkQueue::try_with(|queue| queue.enqueue_unobserved(weak));
}

/// Deliver a queued became-unobserved callback, re-checking the condition
/// at flush time.
pub(crate) fn flush_unobserved(observed: &Arc<dyn Observable>) {
    let core = observed.core();
    core.remove(NodeFlags::UNOBSERVED_PENDING);
    if !core.contains(NodeFlags::WATCHED) && observed.edges().is_empty() {
        tracing::trace!(node = core.id().raw(), "node became unobserved");
        observed.on_unobserved();
    }
}

/// Announce a state change (`DIRTY` or `PROBABLY_DIRTY`) to every
/// observer of `observed`.
///
/// A watched node schedules itself for eager recomputation. The
/// aggregated mask suppresses redundant waves: when the flag is already
/// in the mask, every observer has been told and the walk stops here.
pub(crate) fn report_observers(observed: &Arc<dyn Observable>, flag: NodeFlags) {
    observed.core().check_thread();

    if observed.core().contains(NodeFlags::WATCHED) {
        queue::schedule(observed.clone().as_schedulable());
    }

    forward_to_observers(observed, flag);
}

/// The forwarding half of [`report_observers`], without the watched-self
/// scheduling. A node that just finished recomputing uses this to push
/// `DIRTY` outward without putting itself straight back on the queue.
pub(crate) fn forward_to_observers(observed: &Arc<dyn Observable>, flag: NodeFlags) {
    let edges = observed.edges();
    if edges.mask().contains(flag) {
        return;
    }
    edges.insert_mask(flag);

    let snapshot: SmallVec<[Arc<dyn Derivation>; 8]> = {
        let mut map = edges.observers.lock();
        map.retain(|_, weak| weak.strong_count() > 0);
        map.values().filter_map(Weak::upgrade).collect()
    };

    for observer in snapshot {
        observer.on_dependency_changed(flag);
    }
}

/// Toggle the watched bit.
///
/// Turning it on schedules the node if an invalidation is already
/// pending; turning it off re-runs the unobserved check, since watching
/// was keeping the node alive.
pub(crate) fn set_watched(observed: &Arc<dyn Observable>, watched: bool) {
    let core = observed.core();
    core.check_thread();

    if watched {
        let newly_observed =
            !core.contains(NodeFlags::WATCHED) && observed.edges().is_empty();
        core.insert(NodeFlags::WATCHED);
        if newly_observed {
            observed.on_observed();
        }
        if core.contains(NodeFlags::DIRTY) || core.contains(NodeFlags::PROBABLY_DIRTY) {
            queue::schedule(observed.clone().as_schedulable());
        }
    } else {
        core.remove(NodeFlags::WATCHED);
        check_retire(observed);
    }
}

/// External change listeners of one node.
///
/// Listeners are keyed so a `Subscription` can remove exactly its own
/// entry; notification snapshots the list so a listener may drop its own
/// subscription mid-callback.
pub(crate) struct Listeners {
    next_key: AtomicU64,
    entries: Mutex<Vec<(u64, Arc<dyn Fn() + Send + Sync>)>>,
}

impl Listeners {
    pub(crate) fn new() -> Self {
        Self {
            next_key: AtomicU64::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Returns the listener's key and whether it was the first one.
    pub(crate) fn add(&self, listener: Arc<dyn Fn() + Send + Sync>) -> (u64, bool) {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();
        let first = entries.is_empty();
        entries.push((key, listener));
        (key, first)
    }

    /// Returns true when the removed listener was the last one.
    pub(crate) fn remove(&self, key: u64) -> bool {
        let mut entries = self.entries.lock();
        entries.retain(|(k, _)| *k != key);
        entries.is_empty()
    }

    pub(crate) fn notify(&self) {
        let snapshot: SmallVec<[Arc<dyn Fn() + Send + Sync>; 4]> = self
            .entries
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener();
        }
    }
}

/// Handle to a change-listener registration.
///
/// Dropping the handle removes the listener; when it was the last one the
/// node leaves watched mode.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Remove the listener now instead of at drop time.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
