//! Work Queue
//!
//! One queue exists per thread, created lazily on first use. Every node is
//! permanently bound to the queue of the thread it was constructed on.
//!
//! # Batching
//!
//! The queue does not drain while a batch is open. Batches are reentrant:
//! nesting only bumps a depth counter, and the single drain happens when
//! the outermost batch closes. An un-batched schedule opens and closes a
//! batch on the spot, so a plain write drains before returning.
//!
//! # Drain Algorithm
//!
//! The drain is an explicit work-list iteration, never recursion:
//!
//! 1. Pop and execute scheduled units until the execution queue is empty.
//! 2. Flush the became-unobserved queue.
//! 3. If either phase enqueued more work, repeat.
//!
//! Crucially, the drain runs while the batch depth is still 1. A unit that
//! schedules itself again during execution (a reaction that rewrites its
//! own dependency) just lands back on the same queue and is picked up by
//! the same loop, so a chain of N self-triggering writes runs in O(N)
//! time and O(1) stack depth.
//!
//! Per-unit failures are caught at the loop, forwarded to the queue's
//! error handler when one is registered, and otherwise logged and
//! dropped. The drain continues either way; a failing unit can never
//! abort the writes queued behind it.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, Weak};

use crate::error::{EvalError, GraphError};
use crate::node::{NodeFlags, Observable, SchedulableNode};
use crate::observable;
use crate::scope;

thread_local! {
    static QUEUE: WorkQueue = WorkQueue::new();
}

/// Per-thread scheduler state.
pub(crate) struct WorkQueue {
    scheduled: RefCell<VecDeque<Weak<dyn SchedulableNode>>>,
    retired: RefCell<VecDeque<Weak<dyn Observable>>>,
    batch_depth: Cell<usize>,
    error_handler: RefCell<Option<Rc<dyn Fn(&EvalError)>>>,
}

impl WorkQueue {
    fn new() -> Self {
        Self {
            scheduled: RefCell::new(VecDeque::new()),
            retired: RefCell::new(VecDeque::new()),
            batch_depth: Cell::new(0),
            error_handler: RefCell::new(None),
        }
    }

    pub(crate) fn with<R>(f: impl FnOnce(&WorkQueue) -> R) -> R {
        QUEUE.with(f)
    }

    /// Like `with`, but a no-op during thread teardown.
    pub(crate) fn try_with(f: impl FnOnce(&WorkQueue)) {
        let _ = QUEUE.try_with(f);
    }

    pub(crate) fn enqueue(&self, node: Weak<dyn SchedulableNode>) {
        self.scheduled.borrow_mut().push_back(node);
        if self.batch_depth.get() == 0 {
            self.start_batch();
            self.end_batch();
        }
    }

    pub(crate) fn enqueue_unobserved(&self, node: Weak<dyn Observable>) {
        self.retired.borrow_mut().push_back(node);
    }

    pub(crate) fn start_batch(&self) {
        self.batch_depth.set(self.batch_depth.get() + 1);
    }

    pub(crate) fn end_batch(&self) {
        struct DepthGuard<'a>(&'a Cell<usize>);
        impl Drop for DepthGuard<'_> {
            fn drop(&mut self) {
                self.0.set(self.0.get() - 1);
            }
        }

        // Drain while the depth is still 1: re-schedules during the drain
        // must not trigger a nested drain.
        let _guard = DepthGuard(&self.batch_depth);
        if self.batch_depth.get() == 1 {
            self.drain();
        }
    }

    fn drain(&self) {
        if scope::is_tracking() {
            panic!("{}", GraphError::DrainDuringCapture);
        }

        loop {
            loop {
                let next = self.scheduled.borrow_mut().pop_front();
                let Some(weak) = next else { break };
                let Some(node) = weak.upgrade() else { continue };

                node.core().remove(NodeFlags::SCHEDULED);
                let id = node.core().id();
                tracing::trace!(node = id.raw(), "executing scheduled unit");
                if let Err(payload) =
                    catch_unwind(AssertUnwindSafe(|| node.clone().on_scheduled()))
                {
                    self.forward_error(id, payload);
                }
            }

            loop {
                let next = self.retired.borrow_mut().pop_front();
                let Some(weak) = next else { break };
                let Some(node) = weak.upgrade() else { continue };

                let id = node.core().id();
                if let Err(payload) =
                    catch_unwind(AssertUnwindSafe(|| observable::flush_unobserved(&node)))
                {
                    self.forward_error(id, payload);
                }
            }

            if self.scheduled.borrow().is_empty() {
                break;
            }
        }
    }

    fn forward_error(&self, origin: crate::node::NodeId, payload: Box<dyn std::any::Any + Send>) {
        let handler = self.error_handler.borrow().clone();
        let err = EvalError::from_panic(origin, payload);
        tracing::error!(node = origin.raw(), %err, "scheduled unit failed");
        if let Some(handler) = handler {
            handler(&err);
        }
    }
}

/// Place a node on its queue unless it is already scheduled.
pub(crate) fn schedule(node: Arc<dyn SchedulableNode>) {
    let core = node.core();
    if core.contains(NodeFlags::SCHEDULED) {
        return;
    }
    core.insert(NodeFlags::SCHEDULED);
    let weak = Arc::downgrade(&node);
    WorkQueue::try_with(|queue| queue.enqueue(weak));
}

/// Register the error handler of the current thread's queue.
///
/// The handler receives every failure caught in the drain loop that no
/// per-reaction handler claimed. Without a handler, such failures are
/// logged and dropped; the drain never aborts.
pub fn set_error_handler(handler: impl Fn(&EvalError) + 'static) {
    WorkQueue::with(|queue| {
        *queue.error_handler.borrow_mut() = Some(Rc::new(handler));
    });
}

/// Remove the current thread's queue error handler.
pub fn clear_error_handler() {
    WorkQueue::with(|queue| {
        queue.error_handler.borrow_mut().take();
    });
}

/// Open a batch on the current thread's queue.
///
/// Writes performed while the returned guard is alive are collected and
/// drained once, when the outermost guard drops.
pub fn start_batch() -> BatchGuard {
    WorkQueue::with(|queue| queue.start_batch());
    BatchGuard {
        _not_send: PhantomData,
    }
}

/// Scoped handle to an open batch; closing happens on drop, on every exit
/// path.
pub struct BatchGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        WorkQueue::try_with(|queue| queue.end_batch());
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeCore;
    use std::sync::atomic::{AtomicI32, Ordering};

    struct CountingUnit {
        core: NodeCore,
        runs: AtomicI32,
    }

    impl CountingUnit {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                core: NodeCore::new(),
                runs: AtomicI32::new(0),
            })
        }
    }

    impl SchedulableNode for CountingUnit {
        fn core(&self) -> &NodeCore {
            &self.core
        }

        fn on_scheduled(self: Arc<Self>) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn unbatched_schedule_drains_immediately() {
        let unit = CountingUnit::new();
        schedule(unit.clone());
        assert_eq!(unit.runs.load(Ordering::SeqCst), 1);
        assert!(!unit.core.contains(NodeFlags::SCHEDULED));
    }

    #[test]
    fn batch_defers_drain_until_outermost_close() {
        let unit = CountingUnit::new();

        let outer = start_batch();
        {
            let _inner = start_batch();
            schedule(unit.clone());
            assert_eq!(unit.runs.load(Ordering::SeqCst), 0);
        }
        // Inner close must not drain.
        assert_eq!(unit.runs.load(Ordering::SeqCst), 0);

        drop(outer);
        assert_eq!(unit.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_schedule_is_collapsed() {
        let unit = CountingUnit::new();

        let batch = start_batch();
        schedule(unit.clone());
        schedule(unit.clone());
        schedule(unit.clone());
        drop(batch);

        assert_eq!(unit.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_units_are_skipped() {
        let unit = CountingUnit::new();

        let batch = start_batch();
        schedule(unit.clone());
        drop(unit);
        drop(batch); // must not panic
    }

    struct FailingUnit {
        core: NodeCore,
    }

    impl SchedulableNode for FailingUnit {
        fn core(&self) -> &NodeCore {
            &self.core
        }

        fn on_scheduled(self: Arc<Self>) {
            panic!("unit failure");
        }
    }

    #[test]
    fn drain_forwards_failures_and_continues() {
        use std::sync::Mutex;

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        set_error_handler(move |err| sink.lock().unwrap().push(err.message.clone()));

        let failing = Arc::new(FailingUnit {
            core: NodeCore::new(),
        });
        let unit = CountingUnit::new();

        let batch = start_batch();
        schedule(failing.clone());
        schedule(unit.clone());
        drop(batch);

        // The failing unit did not abort the drain.
        assert_eq!(unit.runs.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().unwrap().as_slice(), ["unit failure"]);

        clear_error_handler();
    }

    #[test]
    fn unhandled_failure_is_swallowed_and_drain_continues() {
        let failing = Arc::new(FailingUnit {
            core: NodeCore::new(),
        });
        let unit = CountingUnit::new();

        // No handler registered on this thread: the failure is logged and
        // dropped, and units queued behind it still run.
        let batch = start_batch();
        schedule(failing.clone());
        schedule(unit.clone());
        drop(batch); // must not panic

        assert_eq!(unit.runs.load(Ordering::SeqCst), 1);
    }
}
