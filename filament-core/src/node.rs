//! Graph Nodes
//!
//! Every participant in the dependency graph (atoms, computed nodes,
//! reactions) is built around a `NodeCore`: a unique ID, the identity of
//! the thread that created the node, and a bitfield of status flags.
//!
//! # Thread Affinity
//!
//! A node is permanently bound to the thread it was constructed on. All
//! mutation of node state must happen on that thread; access from any
//! other thread fails fast before touching anything. This is what lets
//! the engine run without locks held across user code: within one graph
//! there is exactly one writer.
//!
//! # Trait Seams
//!
//! Three internal traits split the roles a node can play:
//!
//! - `SchedulableNode`: can be placed on the work queue and executed.
//! - `Observable`: can be depended on; owns the observer edge set.
//! - `Derivation`: runs a tracked expression; owns a dependency set.
//!
//! A computed node implements all three; an atom is schedulable and
//! observable; a reaction is schedulable and a derivation but never
//! observable.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::error::GraphError;
use crate::observable::ObserverEdges;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

bitflags::bitflags! {
    /// Status flags of a schedulable unit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct NodeFlags: u8 {
        /// The node sits on the work queue awaiting execution.
        const SCHEDULED = 1;
        /// The node definitely needs to recompute.
        const DIRTY = 1 << 1;
        /// A dependency might have changed; must be confirmed before the
        /// cached result can be trusted.
        const PROBABLY_DIRTY = 1 << 2;
        /// The node wants a callback when its observer set empties.
        const UNOBSERVED_REQUIRED = 1 << 3;
        /// A became-unobserved callback is already queued.
        const UNOBSERVED_PENDING = 1 << 4;
        /// The node's tracked expression is currently running.
        const COMPUTING = 1 << 5;
        /// The node has been disposed and is permanently inert.
        const DISPOSED = 1 << 6;
        /// An explicit subscriber wants eager recomputation on every write.
        const WATCHED = 1 << 7;

        /// The flags a derivation can have pending toward its observers.
        const PENDING = Self::DIRTY.bits() | Self::PROBABLY_DIRTY.bits();
    }
}

/// Shared state of every graph node: identity, owning thread, status.
///
/// Flags live in an atomic so node handles stay `Send + Sync`, but every
/// mutation path checks thread affinity first; there is never a second
/// writer to race with.
pub(crate) struct NodeCore {
    id: NodeId,
    owner: ThreadId,
    flags: AtomicU8,
}

impl NodeCore {
    pub(crate) fn new() -> Self {
        Self {
            id: NodeId::next(),
            owner: thread::current().id(),
            flags: AtomicU8::new(NodeFlags::empty().bits()),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn flags(&self) -> NodeFlags {
        NodeFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub(crate) fn contains(&self, flags: NodeFlags) -> bool {
        self.flags().contains(flags)
    }

    pub(crate) fn insert(&self, flags: NodeFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub(crate) fn remove(&self, flags: NodeFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::Relaxed);
    }

    pub(crate) fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Reject access from any thread other than the owner.
    pub(crate) fn check_thread(&self) {
        if !self.is_owner_thread() {
            panic!("{}", GraphError::CrossThreadAccess);
        }
    }
}

/// A unit the work queue can execute.
pub(crate) trait SchedulableNode: Send + Sync {
    fn core(&self) -> &NodeCore;

    /// Called by the drain loop after the `SCHEDULED` flag is cleared.
    fn on_scheduled(self: Arc<Self>);
}

/// A node other derivations may depend on.
pub(crate) trait Observable: Send + Sync {
    fn core(&self) -> &NodeCore;

    fn edges(&self) -> &ObserverEdges;

    /// Resolve this node's own staleness; returns true when the node's
    /// result actually changed. Source atoms are never stale on their own.
    fn dirty_check(self: Arc<Self>) -> bool {
        false
    }

    /// Called when the node gains its first observer (or watcher) after
    /// having none.
    fn on_observed(&self) {}

    /// The deferred became-unobserved callback.
    fn on_unobserved(&self) {}

    /// External change listeners attached to this node.
    fn listeners(&self) -> &crate::observable::Listeners;

    /// View this node as a schedulable unit.
    fn as_schedulable(self: Arc<Self>) -> Arc<dyn SchedulableNode>;
}

/// A node that runs a tracked expression and records what it reads.
pub(crate) trait Derivation: Send + Sync {
    fn core(&self) -> &NodeCore;

    /// A dependency announced a state change (`DIRTY` or `PROBABLY_DIRTY`).
    fn on_dependency_changed(self: Arc<Self>, flag: NodeFlags);

    /// A tracked read observed `observed` under capture-set generation
    /// `token`. Reads reported under a stale token are ignored.
    fn capture(self: Arc<Self>, observed: Arc<dyn Observable>, token: u64);

    /// The invalidation flags this derivation already knows about.
    fn pending_mask(&self) -> NodeFlags {
        self.core().flags() & NodeFlags::PENDING
    }
}
