//! Dependency Capture
//!
//! While a derivation's expression runs, an ambient frame sits on a
//! thread-local stack. Every observable read consults the top frame and,
//! if one is present, reports itself; the owning derivation records the
//! read into its current dependency set and subscribes as an observer.
//!
//! Each frame carries the generation token of the dependency set it was
//! opened for. A read reported under a stale token (the scope was replaced
//! while user code still held a reference into it) is ignored.
//!
//! Nested derivations each push their own frame, so reads always belong to
//! the innermost active derivation. The stack is maintained by an RAII
//! guard and survives unwinding.
//!
//! This module also hosts the two-phase staleness collapse: a node marked
//! `PROBABLY_DIRTY` asks each dependency, depth-first, to resolve its own
//! staleness, short-circuiting on the first dependency that reports an
//! actual change.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::node::{Derivation, NodeCore, NodeFlags, NodeId, Observable};
use crate::observable;

thread_local! {
    static TRACKING: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

struct Frame {
    /// `None` for an untracked frame: reads under it are reported to
    /// nobody, and it masks any outer capturing frame.
    derivation: Option<Weak<dyn Derivation>>,
    node: NodeId,
    token: u64,
}

/// Generation token for dependency sets.
pub(crate) fn next_token() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// The set of observables captured during one evaluation.
///
/// Entry order is read order; each entry implies a live subscription for
/// exactly the lifetime of the set.
pub(crate) struct DependencySet {
    token: u64,
    entries: IndexMap<NodeId, Arc<dyn Observable>>,
}

impl DependencySet {
    pub(crate) fn new(token: u64) -> Self {
        Self {
            token,
            entries: IndexMap::new(),
        }
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    pub(crate) fn insert(&mut self, observed: Arc<dyn Observable>) -> bool {
        self.entries
            .insert(observed.core().id(), observed)
            .is_none()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.entries.contains_key(&id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn snapshot(&self) -> SmallVec<[Arc<dyn Observable>; 8]> {
        self.entries.values().cloned().collect()
    }

    /// Unsubscribe `owner` from every entry.
    pub(crate) fn detach(self, owner: NodeId) {
        for (_, dep) in self.entries {
            observable::remove_observer(&dep, owner);
        }
    }
}

/// RAII frame for one capture scope.
pub(crate) struct TrackingGuard {
    node: NodeId,
}

impl TrackingGuard {
    pub(crate) fn enter(derivation: Weak<dyn Derivation>, node: NodeId, token: u64) -> Self {
        Self::push(Some(derivation), node, token)
    }

    /// A frame that captures nothing. Direct evaluation of an unobserved
    /// computed runs under one so its reads do not land in an enclosing
    /// derivation's set.
    pub(crate) fn enter_untracked(node: NodeId) -> Self {
        Self::push(None, node, 0)
    }

    fn push(derivation: Option<Weak<dyn Derivation>>, node: NodeId, token: u64) -> Self {
        TRACKING.with(|stack| {
            stack.borrow_mut().push(Frame {
                derivation,
                node,
                token,
            });
        });
        Self { node }
    }
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        TRACKING.with(|stack| {
            let popped = stack.borrow_mut().pop();
            if let Some(frame) = popped {
                debug_assert_eq!(
                    frame.node, self.node,
                    "capture scope mismatch: expected {:?}, got {:?}",
                    self.node, frame.node
                );
            }
        });
    }
}

/// Is any capture scope active on this thread?
pub(crate) fn is_tracking() -> bool {
    TRACKING.with(|stack| !stack.borrow().is_empty())
}

/// Report a read of `observed` to the innermost active derivation, if any.
/// A read under an untracked frame is reported to nobody.
pub(crate) fn report_observed(observed: Arc<dyn Observable>) {
    let top = TRACKING.with(|stack| {
        stack
            .borrow()
            .last()
            .map(|frame| (frame.derivation.clone(), frame.token))
    });
    if let Some((Some(weak), token)) = top {
        if let Some(derivation) = weak.upgrade() {
            derivation.capture(observed, token);
        }
    }
}

/// Record `observed` into a derivation's current dependency set and
/// register the derivation as its observer.
///
/// Shared by computed nodes and reactions: the insert happens only when
/// the token still names the live set, and the observer subscription
/// carries the derivation's already-pending flags so the observable's
/// notification mask shrinks to what this observer actually knows.
pub(crate) fn capture_dependency<D>(
    this: &Arc<D>,
    deps: &Mutex<Option<DependencySet>>,
    observed: Arc<dyn Observable>,
    token: u64,
) where
    D: Derivation + 'static,
{
    this.core().check_thread();

    let inserted = {
        let mut guard = deps.lock();
        match guard.as_mut() {
            Some(set) if set.token() == token => set.insert(observed.clone()),
            _ => false,
        }
    };

    if inserted {
        let weak = Arc::downgrade(this) as Weak<dyn Derivation>;
        observable::add_observer(&observed, this.core().id(), weak, this.pending_mask());
    }
}

/// Collapse `PROBABLY_DIRTY` into a definite answer.
///
/// Returns true when the node must re-execute. When no dependency turns
/// out to have actually changed, the possibly-dirty flag is cleared here
/// and on each dependency's notification mask, so the next genuine wave is
/// delivered again.
pub(crate) fn confirm_stale(core: &NodeCore, deps: &Mutex<Option<DependencySet>>) -> bool {
    if core.contains(NodeFlags::DIRTY) {
        return true;
    }

    if core.contains(NodeFlags::PROBABLY_DIRTY) {
        let snapshot: SmallVec<[Arc<dyn Observable>; 8]> = deps
            .lock()
            .as_ref()
            .map(|set| set.snapshot())
            .unwrap_or_default();

        for dep in &snapshot {
            if dep.clone().dirty_check() {
                return true;
            }
        }

        core.remove(NodeFlags::PROBABLY_DIRTY);
        for dep in &snapshot {
            dep.edges().retain_mask(!NodeFlags::PROBABLY_DIRTY);
        }
    }

    false
}

/// Unsubscribe from every dependency of `old` that the live set no longer
/// contains. Called when a capture scope completes, on all exit paths.
pub(crate) fn retire_stale(
    old: Option<DependencySet>,
    deps: &Mutex<Option<DependencySet>>,
    owner: NodeId,
) {
    let Some(old) = old else { return };

    let kept: SmallVec<[NodeId; 8]> = deps
        .lock()
        .as_ref()
        .map(|set| set.entries.keys().copied().collect())
        .unwrap_or_default();

    let mut dropped = 0usize;
    for (id, dep) in old.entries {
        if !kept.contains(&id) {
            observable::remove_observer(&dep, owner);
            dropped += 1;
        }
    }
    if dropped > 0 {
        tracing::trace!(node = owner.raw(), dropped, "capture diff unsubscribed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDerivation {
        core: NodeCore,
    }

    impl Derivation for NullDerivation {
        fn core(&self) -> &NodeCore {
            &self.core
        }

        fn on_dependency_changed(self: Arc<Self>, _flag: NodeFlags) {}

        fn capture(self: Arc<Self>, _observed: Arc<dyn Observable>, _token: u64) {}
    }

    fn null_frame() -> Weak<dyn Derivation> {
        let weak: Weak<NullDerivation> = Weak::new();
        weak
    }

    #[test]
    fn tokens_are_unique() {
        let a = next_token();
        let b = next_token();
        assert_ne!(a, b);
    }

    #[test]
    fn tracking_stack_nests_and_unwinds() {
        assert!(!is_tracking());

        let a = NodeId::next();
        let b = NodeId::next();
        {
            let _outer = TrackingGuard::enter(null_frame(), a, 1);
            assert!(is_tracking());
            {
                let _inner = TrackingGuard::enter(null_frame(), b, 2);
                assert!(is_tracking());
            }
            assert!(is_tracking());
        }
        assert!(!is_tracking());
    }

    #[test]
    fn dependency_set_deduplicates_by_id() {
        let atom = crate::atom::RawAtom::new();
        let observed = atom.as_observable();

        let mut set = DependencySet::new(next_token());
        assert!(set.insert(observed.clone()));
        assert!(!set.insert(observed.clone()));
        assert_eq!(set.len(), 1);
        assert!(set.contains(observed.core().id()));
    }
}
