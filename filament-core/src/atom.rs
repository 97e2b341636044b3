//! Atoms
//!
//! An atom is a source node: mutable state the graph starts from. Reading
//! one inside a tracked expression records a dependency edge; writing one
//! marks every observer dirty and drains the work queue (immediately, or
//! at the close of the enclosing batch).
//!
//! `Atom<T>` stores a value and suppresses writes that compare equal to
//! it. `RawAtom` stores nothing: it is the integration point for external
//! state. A collaborator calls `reported_read` from its getters and
//! `reported_changed` from its mutators, and its state participates in
//! dependency tracking like any atom.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::node::{NodeCore, NodeFlags, Observable, SchedulableNode};
use crate::observable::{self, Listeners, ObserverEdges, Subscription};
use crate::queue;
use crate::scope;

struct AtomInner<T> {
    core: NodeCore,
    edges: ObserverEdges,
    listeners: Listeners,
    value: Mutex<T>,
    equal: Box<dyn Fn(&T, &T) -> bool + Send + Sync>,
}

impl<T: Send + Sync + 'static> Observable for AtomInner<T> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn edges(&self) -> &ObserverEdges {
        &self.edges
    }

    fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    fn as_schedulable(self: Arc<Self>) -> Arc<dyn SchedulableNode> {
        self
    }
}

impl<T: Send + Sync + 'static> SchedulableNode for AtomInner<T> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    // A watched atom lands on the queue when written; execution just
    // notifies external listeners.
    fn on_scheduled(self: Arc<Self>) {
        self.listeners.notify();
    }
}

/// A mutable cell participating in dependency tracking.
///
/// Cloning the handle clones a reference to the same cell. All access must
/// happen on the thread the atom was created on.
pub struct Atom<T> {
    inner: Arc<AtomInner<T>>,
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Atom<T> {
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::with_comparator(value, |a, b| a == b)
    }

    /// An atom gating writes through `equal` instead of `PartialEq`.
    ///
    /// A write for which `equal(&current, &next)` returns true is dropped
    /// without waking any observer.
    pub fn with_comparator(value: T, equal: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(AtomInner {
                core: NodeCore::new(),
                edges: ObserverEdges::new(),
                listeners: Listeners::new(),
                value: Mutex::new(value),
                equal: Box::new(equal),
            }),
        }
    }

    fn as_observable(&self) -> Arc<dyn Observable> {
        self.inner.clone()
    }

    /// Read the value, recording a dependency edge when a capture scope is
    /// active.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.inner.core.check_thread();
        scope::report_observed(self.as_observable());
        self.inner.value.lock().clone()
    }

    /// Read the value without recording a dependency.
    pub fn peek(&self) -> T
    where
        T: Clone,
    {
        self.inner.core.check_thread();
        self.inner.value.lock().clone()
    }

    /// Borrow the value for the duration of `f`, recording a dependency.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.inner.core.check_thread();
        scope::report_observed(self.as_observable());
        f(&self.inner.value.lock())
    }

    /// Write a new value. A value the comparator deems equal to the
    /// current one is dropped without waking any observer.
    pub fn set(&self, value: T) {
        self.inner.core.check_thread();
        {
            let mut current = self.inner.value.lock();
            if (self.inner.equal)(&current, &value) {
                return;
            }
            *current = value;
        }
        let _batch = queue::start_batch();
        observable::report_observers(&self.as_observable(), NodeFlags::DIRTY);
    }

    /// Write through a function of the current value.
    ///
    /// The current value is cloned out before `f` runs, so `f` may read
    /// this atom (or trigger code that does).
    pub fn update(&self, f: impl FnOnce(&T) -> T)
    where
        T: Clone,
    {
        self.inner.core.check_thread();
        let current = self.inner.value.lock().clone();
        self.set(f(&current));
    }

    /// Register a listener called after every accepted write. The atom is
    /// held in watched mode while at least one listener exists.
    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        subscribe_node(&self.as_observable(), &self.inner.listeners, listener)
    }
}

impl<T: std::fmt::Debug + Send + Sync + 'static> std::fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Atom")
            .field("id", &self.inner.core.id().raw())
            .field("value", &*self.inner.value.lock())
            .finish()
    }
}

pub(crate) struct RawAtomInner {
    core: NodeCore,
    edges: ObserverEdges,
    listeners: Listeners,
    on_observed: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    on_unobserved: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    dirty_check: Mutex<Option<Arc<dyn Fn() -> bool + Send + Sync>>>,
}

impl Observable for RawAtomInner {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn edges(&self) -> &ObserverEdges {
        &self.edges
    }

    // Hooks are cloned out of the lock before the call: a callback is free
    // to touch this atom again.

    fn dirty_check(self: Arc<Self>) -> bool {
        let hook = self.dirty_check.lock().clone();
        match hook {
            Some(check) => check(),
            None => false,
        }
    }

    fn on_observed(&self) {
        let callback = self.on_observed.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn on_unobserved(&self) {
        let callback = self.on_unobserved.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    fn as_schedulable(self: Arc<Self>) -> Arc<dyn SchedulableNode> {
        self
    }
}

impl SchedulableNode for RawAtomInner {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn on_scheduled(self: Arc<Self>) {
        self.listeners.notify();
    }
}

/// A valueless atom for integrating external state into the graph.
///
/// The owner of some outside resource calls [`RawAtom::reported_read`] in
/// its accessors and [`RawAtom::reported_changed`] in its mutators.
/// Optional callbacks fire when the first observer arrives and when the
/// last one lets go, so the collaborator can set up and tear down whatever
/// the tracking keeps alive; a dirty-check hook lets possibly-dirty waves
/// collapse without re-running observers.
pub struct RawAtom {
    inner: Arc<RawAtomInner>,
}

impl Clone for RawAtom {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Default for RawAtom {
    fn default() -> Self {
        Self::new()
    }
}

impl RawAtom {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RawAtomInner {
                core: NodeCore::new(),
                edges: ObserverEdges::new(),
                listeners: Listeners::new(),
                on_observed: Mutex::new(None),
                on_unobserved: Mutex::new(None),
                dirty_check: Mutex::new(None),
            }),
        }
    }

    /// A raw atom whose `callback` fires when the observer set empties.
    pub fn with_unobserved_callback(callback: impl Fn() + Send + Sync + 'static) -> Self {
        let raw = Self::new();
        raw.set_unobserved_callback(callback);
        raw
    }

    pub(crate) fn as_observable(&self) -> Arc<dyn Observable> {
        self.inner.clone()
    }

    /// Record a dependency on this atom when a capture scope is active.
    pub fn reported_read(&self) {
        self.inner.core.check_thread();
        scope::report_observed(self.as_observable());
    }

    /// Mark every observer dirty. Drains immediately outside a batch.
    pub fn reported_changed(&self) {
        self.inner.core.check_thread();
        let _batch = queue::start_batch();
        observable::report_observers(&self.as_observable(), NodeFlags::DIRTY);
    }

    /// Mark every observer possibly dirty.
    ///
    /// Observers confirm before re-executing: each one calls back into the
    /// dirty-check hook, and when it reports no actual change the wave
    /// collapses without running anything.
    pub fn reported_probably_dirty(&self) {
        self.inner.core.check_thread();
        let _batch = queue::start_batch();
        observable::report_observers(&self.as_observable(), NodeFlags::PROBABLY_DIRTY);
    }

    /// Install the hook consulted when an observer confirms a
    /// possibly-dirty wave. It returns whether the external state actually
    /// changed; without a hook the answer is always no.
    pub fn set_dirty_check(&self, check: impl Fn() -> bool + Send + Sync + 'static) {
        self.inner.core.check_thread();
        *self.inner.dirty_check.lock() = Some(Arc::new(check));
    }

    /// Replace the callback fired when the atom gains its first observer.
    pub fn set_observed_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner.core.check_thread();
        *self.inner.on_observed.lock() = Some(Arc::new(callback));
    }

    /// Replace the callback fired when the observer set empties.
    pub fn set_unobserved_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner.core.check_thread();
        self.inner.core.insert(NodeFlags::UNOBSERVED_REQUIRED);
        *self.inner.on_unobserved.lock() = Some(Arc::new(callback));
    }

    /// Register a listener called after every reported change.
    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        subscribe_node(&self.as_observable(), &self.inner.listeners, listener)
    }

    /// Is anything currently observing this atom? True while the atom has
    /// observer edges, while it is watched, and while a capture scope is
    /// active on this thread (a read right now would be tracked).
    pub fn is_observed(&self) -> bool {
        !self.inner.edges.is_empty()
            || self.inner.core.contains(NodeFlags::WATCHED)
            || scope::is_tracking()
    }
}

impl std::fmt::Debug for RawAtom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawAtom")
            .field("id", &self.inner.core.id().raw())
            .finish()
    }
}

/// Shared listener wiring: the first listener flips the node into watched
/// mode, the last removal flips it back and lets the unobserved lifecycle
/// resume.
pub(crate) fn subscribe_node(
    observed: &Arc<dyn Observable>,
    listeners: &Listeners,
    listener: impl Fn() + Send + Sync + 'static,
) -> Subscription {
    observed.core().check_thread();
    let (key, first) = listeners.add(Arc::new(listener));
    if first {
        observable::set_watched(observed, true);
    }

    let weak = Arc::downgrade(observed);
    Subscription::new(move || {
        if let Some(observed) = weak.upgrade() {
            // A handle dropped on a foreign thread still removes its
            // listener; the watched bit is owner-thread state and stays.
            if observed.listeners().remove(key) && observed.core().is_owner_thread() {
                let _batch = queue::start_batch();
                observable::set_watched(&observed, false);
            }
        }
    })
}
