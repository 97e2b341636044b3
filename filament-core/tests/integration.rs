//! Integration Tests for the Reactive Engine
//!
//! These tests verify that atoms, computed nodes, reactions, and batching
//! work together correctly.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use filament_core::{
    autorun, batch, clear_error_handler, expr, set_error_handler, when, Atom, Computed, RawAtom,
};

/// A reaction observing one atom runs once at subscription time, then once
/// per write that actually changes the value, in write order.
#[test]
fn reaction_runs_once_per_changing_write() {
    let cell = Atom::new(0);
    let log: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = log.clone();
    let tracked = cell.clone();
    let _handle = autorun(move || {
        sink.lock().unwrap().push(tracked.get());
    });

    cell.set(1);
    cell.set(2);
    cell.set(2); // equal write, no run
    cell.set(3);

    assert_eq!(log.lock().unwrap().as_slice(), [0, 1, 2, 3]);
}

/// A computed sum of two atoms recomputes exactly when either input
/// changes; a no-op write produces no extra run.
#[test]
fn sum_records_changed_results_only() {
    let a = Atom::new(0);
    let b = Atom::new(0);
    let sum = {
        let (a, b) = (a.clone(), b.clone());
        Computed::new(move || a.get() + b.get())
    };

    let log: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let tracked = sum.clone();
    let _handle = autorun(move || {
        sink.lock().unwrap().push(tracked.get());
    });

    a.set(1);
    b.set(2);
    a.set(3);
    a.set(3); // no-op

    assert_eq!(log.lock().unwrap().as_slice(), [0, 1, 3, 5]);
}

fn pipeline(a: &Atom<i32>, b: &Atom<i32>) -> Computed<i32> {
    let stage1 = {
        let (a, b) = (a.clone(), b.clone());
        Computed::new(move || a.get() + b.get())
    };
    let stage2 = {
        let prev = stage1.clone();
        Computed::new(move || prev.get() * 10)
    };
    let stage3 = {
        let prev = stage2.clone();
        Computed::new(move || prev.get() + 5)
    };
    let prev = stage3.clone();
    Computed::new(move || prev.get() * 2)
}

/// Six writes through a four-stage pipeline: unbatched, every changing
/// write surfaces; in one batch only the final state surfaces.
#[test]
fn batch_collapses_intermediate_states() {
    let run = |batched: bool| -> Vec<i32> {
        let a = Atom::new(0);
        let b = Atom::new(0);
        let out = pipeline(&a, &b);

        let log: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let tracked = out.clone();
        let _handle = autorun(move || {
            sink.lock().unwrap().push(tracked.get());
        });

        let writes = |a: &Atom<i32>, b: &Atom<i32>| {
            a.set(1);
            a.set(1); // no-op
            b.set(2);
            a.set(3);
            b.set(2); // no-op
            b.set(4);
        };

        if batched {
            batch(|| writes(&a, &b));
        } else {
            writes(&a, &b);
        }

        let result = log.lock().unwrap().clone();
        result
    };

    // ((a + b) * 10 + 5) * 2
    assert_eq!(run(false), [10, 30, 70, 110, 150]);
    assert_eq!(run(true), [10, 150]);
}

/// Disposing an autorun handle stops all future invocations.
#[test]
fn disposed_autorun_never_runs_again() {
    let cell = Atom::new(0);
    let runs = Arc::new(AtomicI32::new(0));

    let sink = runs.clone();
    let tracked = cell.clone();
    let handle = autorun(move || {
        tracked.get();
        sink.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    handle.dispose();

    cell.set(1);
    cell.set(2);
    cell.set(3);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

/// A reaction that rewrites its own dependency converges iteratively: one
/// million self-increments complete with a bounded call stack.
#[test]
fn self_incrementing_reaction_converges() {
    const LIMIT: i32 = 1_000_000;

    let counter = Atom::new(0);
    let tracked = counter.clone();
    let _handle = autorun(move || {
        let v = tracked.get();
        if v < LIMIT {
            tracked.set(v + 1);
        }
    });

    assert_eq!(counter.peek(), LIMIT);
}

/// `when` fires exactly once, on the first write that makes the predicate
/// true, and never again.
#[test]
fn when_fires_exactly_once() {
    let cell = Atom::new(0);
    let fired = Arc::new(AtomicI32::new(0));

    let sink = fired.clone();
    let tracked = cell.clone();
    let _handle = when(
        move || tracked.get() > 10,
        move || {
            sink.fetch_add(1, Ordering::SeqCst);
        },
    );

    cell.set(5);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    cell.set(11);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    cell.set(0);
    cell.set(50);
    cell.set(100);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

/// Reading two atoms inline re-runs the reaction on every batch that
/// touched either one; reading their sum through an anonymous computed
/// wrapper re-runs it only when the sum actually differs.
#[test]
fn wrapped_expression_gates_on_result_change() {
    let a = Atom::new(0);
    let b = Atom::new(0);

    let inline_runs = Arc::new(AtomicI32::new(0));
    let wrapped_runs = Arc::new(AtomicI32::new(0));

    let _inline = {
        let (a, b) = (a.clone(), b.clone());
        let sink = inline_runs.clone();
        autorun(move || {
            let _sum = a.get() + b.get();
            sink.fetch_add(1, Ordering::SeqCst);
        })
    };

    let _wrapped = {
        let (a, b) = (a.clone(), b.clone());
        let sink = wrapped_runs.clone();
        autorun(move || {
            let (a, b) = (a.clone(), b.clone());
            let _sum = expr(move || a.get() + b.get());
            sink.fetch_add(1, Ordering::SeqCst);
        })
    };

    // Net-zero round trip inside one batch.
    batch(|| {
        a.set(5);
        a.set(0);
    });

    assert_eq!(inline_runs.load(Ordering::SeqCst), 2);
    assert_eq!(wrapped_runs.load(Ordering::SeqCst), 1);

    // A batch with a real net change re-runs both.
    batch(|| {
        a.set(1);
        b.set(2);
    });

    assert_eq!(inline_runs.load(Ordering::SeqCst), 3);
    assert_eq!(wrapped_runs.load(Ordering::SeqCst), 2);
}

/// Accessing a node from a thread other than its owner fails fast.
#[test]
fn cross_thread_access_is_rejected() {
    let cell = Atom::new(1);
    let writer = std::thread::spawn(move || cell.set(2));
    assert!(writer.join().is_err());

    let cell = Atom::new(1);
    let reader = std::thread::spawn(move || cell.get());
    assert!(reader.join().is_err());
}

/// A raw atom's unobserved callback fires once nothing depends on it
/// anymore, after the deferred flush.
#[test]
fn raw_atom_unobserved_callback_fires_on_release() {
    let released = Arc::new(AtomicI32::new(0));
    let raw = {
        let sink = released.clone();
        RawAtom::with_unobserved_callback(move || {
            sink.fetch_add(1, Ordering::SeqCst);
        })
    };

    let external = Arc::new(AtomicI32::new(7));
    let view = {
        let (raw, external) = (raw.clone(), external.clone());
        Computed::new(move || {
            raw.reported_read();
            external.load(Ordering::SeqCst)
        })
    };

    let tracked = view.clone();
    let handle = autorun(move || {
        tracked.get();
    });
    assert!(raw.is_observed());
    assert_eq!(released.load(Ordering::SeqCst), 0);

    drop(handle);
    assert!(!raw.is_observed());
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

/// A failing reaction is reported to the queue's error handler and does
/// not abort the drain: the other reaction in the same batch still runs.
#[test]
fn queue_error_handler_receives_reaction_failures() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    set_error_handler(move |err| sink.lock().unwrap().push(err.message.clone()));

    let cell = Atom::new(0);
    let runs = Arc::new(AtomicI32::new(0));

    let tracked = cell.clone();
    let _failing = autorun(move || {
        if tracked.get() == 1 {
            panic!("observer blew up");
        }
    });

    let tracked = cell.clone();
    let sink = runs.clone();
    let _counting = autorun(move || {
        tracked.get();
        sink.fetch_add(1, Ordering::SeqCst);
    });

    cell.set(1);

    assert_eq!(seen.lock().unwrap().as_slice(), ["observer blew up"]);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    clear_error_handler();
}

/// With no error handler registered anywhere, a failing reaction is
/// logged and dropped: the write that triggered it returns normally and
/// the other reaction in the same batch still runs.
#[test]
fn unhandled_reaction_failure_does_not_abort_the_drain() {
    let cell = Atom::new(0);
    let runs = Arc::new(AtomicI32::new(0));

    let tracked = cell.clone();
    let _failing = autorun(move || {
        if tracked.get() == 1 {
            panic!("observer blew up");
        }
    });

    let tracked = cell.clone();
    let sink = runs.clone();
    let _counting = autorun(move || {
        tracked.get();
        sink.fetch_add(1, Ordering::SeqCst);
    });

    cell.set(1); // must not panic

    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// A subscribed atom written twice in one batch notifies its listener
/// once, at the close of the batch; unbatched writes notify one each.
#[test]
fn subscribed_atom_notifies_once_per_draining_batch() {
    let cell = Atom::new(0);
    let hits = Arc::new(AtomicI32::new(0));

    let sink = hits.clone();
    let _sub = cell.subscribe(move || {
        sink.fetch_add(1, Ordering::SeqCst);
    });

    batch(|| {
        cell.set(1);
        cell.set(2);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    });
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(cell.peek(), 2);

    cell.set(3);
    cell.set(4);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

/// A failure crossing a nested computed keeps the origin of the node that
/// first raised it: readers at every level see the same structural error.
#[test]
fn nested_failure_keeps_its_origin() {
    let inner: Computed<i32> = Computed::new(|| panic!("inner exploded"));
    let outer = {
        let inner = inner.clone();
        Computed::new(move || inner.get() + 1)
    };

    let _keep_inner = inner.keep_alive();
    let _keep_outer = outer.keep_alive();

    let from_outer = outer.try_get().unwrap_err();
    let from_inner = inner.try_get().unwrap_err();

    assert_eq!(from_outer, from_inner);
    assert_eq!(from_outer.message, "inner exploded");
}

/// A self-referential computed node is detected even on the direct
/// evaluation path, where nothing observes it.
#[test]
fn unobserved_self_read_is_detected() {
    use filament_core::FailureKind;

    let slot: Arc<Mutex<Option<Computed<i32>>>> = Arc::new(Mutex::new(None));
    let looped = {
        let slot = slot.clone();
        Computed::new(move || {
            let inner = slot.lock().unwrap().clone();
            inner.map(|c| c.get()).unwrap_or(0)
        })
    };
    *slot.lock().unwrap() = Some(looped.clone());

    let err = looped.try_get().unwrap_err();
    assert_eq!(err.kind, FailureKind::CircularDependency);
}

/// `peek` reads without subscribing: writes to a peeked atom never re-run
/// the reaction.
#[test]
fn peek_establishes_no_dependency() {
    let tracked = Atom::new(0);
    let peeked = Atom::new(0);
    let runs = Arc::new(AtomicI32::new(0));

    let sink = runs.clone();
    let (t, p) = (tracked.clone(), peeked.clone());
    let _handle = autorun(move || {
        t.get();
        p.peek();
        sink.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    peeked.set(5);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    tracked.set(1);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// A computed node that went unobserved drops its cache: a later read
/// recomputes fresh instead of returning data from before dormancy.
#[test]
fn dormant_computed_recomputes_fresh() {
    let evals = Arc::new(AtomicI32::new(0));
    let cell = Atom::new(1);
    let view = {
        let cell = cell.clone();
        let sink = evals.clone();
        Computed::new(move || {
            sink.fetch_add(1, Ordering::SeqCst);
            cell.get() * 100
        })
    };

    let tracked = view.clone();
    let handle = autorun(move || {
        tracked.get();
    });
    assert_eq!(evals.load(Ordering::SeqCst), 1);

    drop(handle);

    // Unobserved: direct evaluation, no cache.
    assert_eq!(view.get(), 100);
    assert_eq!(view.get(), 100);
    assert_eq!(evals.load(Ordering::SeqCst), 3);
}
