//! Reactions
//!
//! A reaction is a derivation without observers: it exists to perform an
//! external effect whenever its dependencies actually change. It is
//! created already dirty, so the first run happens immediately (or at the
//! close of the enclosing batch) and establishes the initial dependency
//! set.
//!
//! On each wake-up the reaction first collapses `PROBABLY_DIRTY` the same
//! way a computed node does; only a confirmed change runs the effect. The
//! effect executes inside a fresh capture scope that replaces the previous
//! dependency set wholesale.
//!
//! Failures raised by the effect go to the reaction's own error handler
//! when one is registered, otherwise to the owning queue's handler,
//! otherwise they are logged and dropped. The drain always continues
//! either way.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::EvalError;
use crate::node::{Derivation, NodeCore, NodeFlags, Observable, SchedulableNode};
use crate::queue;
use crate::scope::{self, DependencySet, TrackingGuard};

enum ReactionJob {
    /// Re-run the effect on every confirmed change.
    Autorun(Box<dyn FnMut() + Send>),
    /// Track the predicate; fire the effect once when it first holds.
    When {
        predicate: Box<dyn FnMut() -> bool + Send>,
        effect: Option<Box<dyn FnOnce() + Send>>,
    },
}

enum JobOutcome {
    Keep,
    Fire,
}

struct ReactionInner {
    core: NodeCore,
    job: Mutex<ReactionJob>,
    deps: Mutex<Option<DependencySet>>,
    on_error: Mutex<Option<Box<dyn Fn(&EvalError) + Send + Sync>>>,
}

impl ReactionInner {
    fn dispose(&self) {
        if self.core.contains(NodeFlags::DISPOSED) {
            return;
        }
        // Batched so the unobserved callbacks of released dependencies
        // flush before this call returns.
        let _batch = queue::start_batch();
        self.core.insert(NodeFlags::DISPOSED);
        if let Some(set) = self.deps.lock().take() {
            set.detach(self.core.id());
        }
        tracing::trace!(node = self.core.id().raw(), "reaction disposed");
    }

    fn forward_failure(&self, payload: Box<dyn Any + Send>) {
        let err = EvalError::from_panic(self.core.id(), payload);
        tracing::debug!(node = self.core.id().raw(), %err, "reaction effect failed");
        match &*self.on_error.lock() {
            Some(handler) => handler(&err),
            None => err.into_panic(),
        }
    }

    fn run(self: &Arc<Self>) {
        // Clear before running: a write performed by the effect on one of
        // its own dependencies must re-mark the reaction.
        self.core.remove(NodeFlags::DIRTY | NodeFlags::PROBABLY_DIRTY);

        let token = scope::next_token();
        let old_deps = self.deps.lock().replace(DependencySet::new(token));

        let outcome = {
            let weak = Arc::downgrade(self) as Weak<dyn Derivation>;
            let _scope = TrackingGuard::enter(weak, self.core.id(), token);
            catch_unwind(AssertUnwindSafe(|| match &mut *self.job.lock() {
                ReactionJob::Autorun(effect) => {
                    effect();
                    JobOutcome::Keep
                }
                ReactionJob::When { predicate, .. } => {
                    if predicate() {
                        JobOutcome::Fire
                    } else {
                        JobOutcome::Keep
                    }
                }
            }))
        };

        scope::retire_stale(old_deps, &self.deps, self.core.id());

        match outcome {
            Ok(JobOutcome::Keep) => {}
            Ok(JobOutcome::Fire) => {
                // One-shot: detach first, so nothing the effect does can
                // re-arm the predicate.
                self.dispose();
                let effect = match &mut *self.job.lock() {
                    ReactionJob::When { effect, .. } => effect.take(),
                    ReactionJob::Autorun(_) => None,
                };
                if let Some(effect) = effect {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(effect)) {
                        self.forward_failure(payload);
                    }
                }
            }
            Err(payload) => {
                // A failing predicate counts as "not yet true": the
                // reaction stays armed on its freshly captured set.
                let is_when = matches!(&*self.job.lock(), ReactionJob::When { .. });
                if is_when {
                    let err = EvalError::from_panic(self.core.id(), payload);
                    tracing::warn!(node = self.core.id().raw(), %err, "predicate failed");
                } else {
                    self.forward_failure(payload);
                }
            }
        }
    }
}

impl SchedulableNode for ReactionInner {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn on_scheduled(self: Arc<Self>) {
        if self.core.contains(NodeFlags::DISPOSED) {
            return;
        }
        if !scope::confirm_stale(&self.core, &self.deps) {
            return;
        }
        self.run();
    }
}

impl Derivation for ReactionInner {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn on_dependency_changed(self: Arc<Self>, flag: NodeFlags) {
        self.core.check_thread();
        if self.core.contains(NodeFlags::DISPOSED) {
            return;
        }
        self.core.insert(flag & NodeFlags::PENDING);
        queue::schedule(self);
    }

    fn capture(self: Arc<Self>, observed: Arc<dyn Observable>, token: u64) {
        if self.core.contains(NodeFlags::DISPOSED) {
            return;
        }
        scope::capture_dependency(&self, &self.deps, observed, token);
    }
}

impl Drop for ReactionInner {
    fn drop(&mut self) {
        if self.core.is_owner_thread() {
            if let Some(set) = self.deps.get_mut().take() {
                set.detach(self.core.id());
            }
        }
    }
}

/// Disposable handle to a running reaction.
///
/// Dropping the handle disposes the reaction: the effect never runs again
/// regardless of further writes to its former dependencies.
pub struct Reaction {
    inner: Arc<ReactionInner>,
}

impl Reaction {
    fn spawn(job: ReactionJob) -> Self {
        let inner = Arc::new(ReactionInner {
            core: NodeCore::new(),
            job: Mutex::new(job),
            deps: Mutex::new(None),
            on_error: Mutex::new(None),
        });
        inner.core.insert(NodeFlags::DIRTY);
        let schedulable: Arc<dyn SchedulableNode> = inner.clone();
        queue::schedule(schedulable);
        Self { inner }
    }

    /// Stop the reaction now. Equivalent to dropping the handle.
    pub fn dispose(self) {}

    pub fn is_disposed(&self) -> bool {
        self.inner.core.contains(NodeFlags::DISPOSED)
    }

    /// Route this reaction's failures to `handler` instead of the queue's
    /// handler.
    pub fn set_error_handler(&self, handler: impl Fn(&EvalError) + Send + Sync + 'static) {
        *self.inner.on_error.lock() = Some(Box::new(handler));
    }
}

impl Drop for Reaction {
    fn drop(&mut self) {
        if self.inner.core.is_owner_thread() {
            self.inner.dispose();
        }
    }
}

impl std::fmt::Debug for Reaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaction")
            .field("id", &self.inner.core.id().raw())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Run `effect` now and again after every batch in which one of its
/// dependencies changed, until the returned handle is dropped.
pub fn autorun(effect: impl FnMut() + Send + 'static) -> Reaction {
    Reaction::spawn(ReactionJob::Autorun(Box::new(effect)))
}

/// Track `predicate` and run `effect` exactly once, the first time the
/// predicate evaluates true. The reaction disposes itself before the
/// effect runs.
pub fn when(
    predicate: impl FnMut() -> bool + Send + 'static,
    effect: impl FnOnce() + Send + 'static,
) -> Reaction {
    Reaction::spawn(ReactionJob::When {
        predicate: Box::new(predicate),
        effect: Some(Box::new(effect)),
    })
}
