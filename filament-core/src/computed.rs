//! Computed Nodes
//!
//! A computed node is both observable and a derivation: it caches the
//! result of a tracked expression and recomputes only when a dependency
//! confirms an actual change.
//!
//! # Recompute-If-Needed
//!
//! 1. `DIRTY` set: recompute unconditionally.
//! 2. `PROBABLY_DIRTY` set: ask each dependency, depth-first, to resolve
//!    its own staleness; recompute only when one reports a real change.
//!    When none does, the flag collapses to clean without running the
//!    expression.
//! 3. After recomputing, compare old and new results with the supplied
//!    comparator. Only a changed result pushes `DIRTY` to observers, so a
//!    write that round-trips back to its old value never cascades.
//!
//! A failing expression is cached like a value: the captured failure is
//! redelivered to every reader until a recompute succeeds, and two
//! structurally equal failures count as no change.
//!
//! # Lifecycle
//!
//! While observed (or watched), the node keeps its cache and its
//! dependency subscriptions. When the last observer leaves, a deferred
//! callback tears both down; a node read while completely unobserved
//! evaluates its expression directly, with no capture and no cache, since
//! nothing would keep the cache valid.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::atom::subscribe_node;
use crate::error::EvalError;
use crate::node::{Derivation, NodeCore, NodeFlags, Observable, SchedulableNode};
use crate::observable::{self, Listeners, ObserverEdges, Subscription};
use crate::scope::{self, DependencySet, TrackingGuard};

enum CachedResult<T> {
    Empty,
    Value(T),
    Failed(EvalError),
}

struct ComputedInner<T> {
    core: NodeCore,
    edges: ObserverEdges,
    listeners: Listeners,
    expr: Box<dyn Fn() -> T + Send + Sync>,
    equal: Box<dyn Fn(&T, &T) -> bool + Send + Sync>,
    cache: Mutex<CachedResult<T>>,
    deps: Mutex<Option<DependencySet>>,
}

impl<T: Send + Sync + 'static> ComputedInner<T> {
    /// Bring the cache up to date; returns whether the cached result
    /// changed during this call.
    fn actualize(self: &Arc<Self>) -> bool {
        let has_value = !matches!(&*self.cache.lock(), CachedResult::Empty);
        if has_value && !scope::confirm_stale(&self.core, &self.deps) {
            return false;
        }
        self.recompute()
    }

    fn recompute(self: &Arc<Self>) -> bool {
        // Clear before running: an invalidation arriving mid-expression
        // (the expression writes one of its own dependencies) must stick.
        self.core.remove(NodeFlags::DIRTY | NodeFlags::PROBABLY_DIRTY);

        let token = scope::next_token();
        let old_deps = self.deps.lock().replace(DependencySet::new(token));

        self.core.insert(NodeFlags::COMPUTING);
        let result = {
            let weak = Arc::downgrade(self) as Weak<dyn Derivation>;
            let _scope = TrackingGuard::enter(weak, self.core.id(), token);
            catch_unwind(AssertUnwindSafe(|| (self.expr)()))
        };
        self.core.remove(NodeFlags::COMPUTING);

        scope::retire_stale(old_deps, &self.deps, self.core.id());

        let next = match result {
            Ok(value) => CachedResult::Value(value),
            Err(payload) => {
                let err = EvalError::from_panic(self.core.id(), payload);
                tracing::debug!(node = self.core.id().raw(), %err, "expression failed");
                CachedResult::Failed(err)
            }
        };

        let (changed, had_result) = {
            let mut cache = self.cache.lock();
            let verdict = match (&*cache, &next) {
                (CachedResult::Empty, _) => (true, false),
                (CachedResult::Value(old), CachedResult::Value(new)) => {
                    (!(self.equal)(old, new), true)
                }
                (CachedResult::Failed(old), CachedResult::Failed(new)) => (old != new, true),
                _ => (true, true),
            };
            *cache = next;
            verdict
        };

        // The first result ever computed has no stale holders to notify.
        if changed && had_result {
            let this: Arc<dyn Observable> = self.clone();
            observable::forward_to_observers(&this, NodeFlags::DIRTY);
        }
        changed
    }

    /// Evaluation for a node nothing observes: run the expression under a
    /// masking frame so its reads are captured by nobody.
    fn eval_direct(&self) -> Result<T, EvalError> {
        self.core.insert(NodeFlags::COMPUTING);
        let result = {
            let _scope = TrackingGuard::enter_untracked(self.core.id());
            catch_unwind(AssertUnwindSafe(|| (self.expr)()))
        };
        self.core.remove(NodeFlags::COMPUTING);
        result.map_err(|payload| EvalError::from_panic(self.core.id(), payload))
    }
}

impl<T: Send + Sync + 'static> Observable for ComputedInner<T> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn edges(&self) -> &ObserverEdges {
        &self.edges
    }

    fn dirty_check(self: Arc<Self>) -> bool {
        self.actualize()
    }

    // Dormancy teardown: drop all subscriptions and the cache so a later
    // read recomputes fresh instead of trusting data from before the node
    // went unobserved.
    fn on_unobserved(&self) {
        if let Some(set) = self.deps.lock().take() {
            set.detach(self.core.id());
        }
        *self.cache.lock() = CachedResult::Empty;
        self.core.remove(NodeFlags::PROBABLY_DIRTY);
        self.core.insert(NodeFlags::DIRTY);
    }

    fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    fn as_schedulable(self: Arc<Self>) -> Arc<dyn SchedulableNode> {
        self
    }
}

impl<T: Send + Sync + 'static> SchedulableNode for ComputedInner<T> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    // Watched nodes recompute eagerly; external listeners hear about a
    // result that actually changed.
    fn on_scheduled(self: Arc<Self>) {
        if self.actualize() {
            self.listeners.notify();
        }
    }
}

impl<T: Send + Sync + 'static> Derivation for ComputedInner<T> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn on_dependency_changed(self: Arc<Self>, flag: NodeFlags) {
        self.core.check_thread();
        let pending = flag & NodeFlags::PENDING;
        if self.core.contains(pending) {
            return;
        }
        self.core.insert(pending);

        // Forward a weakened wave: observers must confirm before trusting
        // their own caches.
        let this: Arc<dyn Observable> = self;
        observable::report_observers(&this, NodeFlags::PROBABLY_DIRTY);
    }

    fn capture(self: Arc<Self>, observed: Arc<dyn Observable>, token: u64) {
        scope::capture_dependency(&self, &self.deps, observed, token);
    }
}

impl<T> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        // A handle dropped on a foreign thread leaves its observer entries
        // behind as dead weak references; they are pruned on the next
        // notification wave.
        if self.core.is_owner_thread() {
            if let Some(set) = self.deps.get_mut().take() {
                let _batch = crate::queue::start_batch();
                set.detach(self.core.id());
            }
        }
    }
}

/// A cached derivation over other atoms and computed nodes.
///
/// Cloning the handle clones a reference to the same node. All access must
/// happen on the thread the node was created on.
pub struct Computed<T> {
    inner: Arc<ComputedInner<T>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Computed<T> {
    pub fn new(expr: impl Fn() -> T + Send + Sync + 'static) -> Self
    where
        T: PartialEq,
    {
        Self::with_comparator(expr, |a, b| a == b)
    }

    /// A computed node with a caller-supplied equality comparator. Results
    /// comparing equal do not propagate to observers.
    pub fn with_comparator(
        expr: impl Fn() -> T + Send + Sync + 'static,
        equal: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::new(ComputedInner {
            core: NodeCore::new(),
            edges: ObserverEdges::new(),
            listeners: Listeners::new(),
            expr: Box::new(expr),
            equal: Box::new(equal),
            cache: Mutex::new(CachedResult::Empty),
            deps: Mutex::new(None),
        });
        inner.core.insert(NodeFlags::UNOBSERVED_REQUIRED);
        Self { inner }
    }

    fn as_observable(&self) -> Arc<dyn Observable> {
        self.inner.clone()
    }

    /// Read the value, recomputing if stale. Registers the read with the
    /// enclosing capture scope; a cached failure is redelivered by panic.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        match self.read(true) {
            Ok(value) => value,
            Err(err) => deliver(err),
        }
    }

    /// Like [`Computed::get`], but a failing expression comes back as an
    /// `Err` instead of a panic.
    pub fn try_get(&self) -> Result<T, EvalError>
    where
        T: Clone,
    {
        self.read(true)
    }

    /// Read without registering a dependency, for introspection.
    pub fn peek(&self) -> T
    where
        T: Clone,
    {
        match self.read(false) {
            Ok(value) => value,
            Err(err) => deliver(err),
        }
    }

    pub fn try_peek(&self) -> Result<T, EvalError>
    where
        T: Clone,
    {
        self.read(false)
    }

    fn read(&self, track: bool) -> Result<T, EvalError>
    where
        T: Clone,
    {
        let inner = &self.inner;
        inner.core.check_thread();

        // The node's own expression read it back: fail instead of looping.
        if inner.core.contains(NodeFlags::COMPUTING) {
            return Err(EvalError::circular(inner.core.id()));
        }

        if track {
            scope::report_observed(self.as_observable());
        }

        if inner.edges.is_empty() && !inner.core.contains(NodeFlags::WATCHED) {
            return inner.eval_direct();
        }

        inner.actualize();
        match &*inner.cache.lock() {
            CachedResult::Value(value) => Ok(value.clone()),
            CachedResult::Failed(err) => Err(err.clone()),
            CachedResult::Empty => unreachable!("actualize always populates the cache"),
        }
    }

    /// Register a listener called whenever the cached result changes. The
    /// node recomputes eagerly while at least one listener exists.
    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        subscribe_node(&self.as_observable(), &self.inner.listeners, listener)
    }

    /// Hold the node in watched mode without listening for changes: it
    /// keeps its cache and recomputes eagerly until the handle drops.
    pub fn keep_alive(&self) -> Subscription {
        self.subscribe(|| {})
    }
}

impl<T: Send + Sync + 'static> std::fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.inner.core.id().raw())
            .finish_non_exhaustive()
    }
}

/// Redeliver a failure to the caller. Inside a tracked evaluation the
/// typed payload travels to the enclosing derivation boundary with its
/// origin intact; at top level a plain panic message reads better.
fn deliver(err: EvalError) -> ! {
    if scope::is_tracking() {
        err.into_panic()
    } else {
        panic!("{err}")
    }
}
