//! Filament Core
//!
//! This crate provides the core runtime for the Filament reactive
//! dependency-tracking engine. It implements:
//!
//! - Reactive primitives (atoms, computed nodes, reactions)
//! - Two-phase dirty propagation with equality-gated recomputation
//! - Per-thread work queues with reentrant batching
//! - Dynamic dependency capture with automatic subscription diffing
//!
//! Writes to an atom invalidate exactly the derivations that read it, and
//! a derivation re-runs only when a dependency's result actually changed.
//! Each dependency graph is confined to the thread that created it; see
//! the [`queue`] module docs for the affinity and scheduling rules.
//!
//! # Architecture
//!
//! - `atom`: mutable source cells, plus the raw integration surface for
//!   external state
//! - `computed`: cached derivations with failure capture
//! - `reaction`: effects driven by confirmed dependency changes
//! - `queue`: the per-thread scheduler, batching, and error routing
//! - `error`: the failure taxonomy
//!
//! # Example
//!
//! ```rust,ignore
//! use filament_core::{autorun, Atom, Computed};
//!
//! let count = Atom::new(0);
//!
//! let doubled = Computed::new({
//!     let count = count.clone();
//!     move || count.get() * 2
//! });
//!
//! let tracker = autorun({
//!     let doubled = doubled.clone();
//!     move || println!("doubled = {}", doubled.get())
//! });
//!
//! // The reaction ran once already; this write runs it again.
//! count.set(5);
//!
//! drop(tracker); // further writes no longer print
//! ```

pub mod atom;
pub mod computed;
pub mod error;
mod node;
mod observable;
pub mod queue;
pub mod reaction;
mod scope;

pub use atom::{Atom, RawAtom};
pub use computed::Computed;
pub use error::{EvalError, FailureKind, GraphError};
pub use node::NodeId;
pub use observable::Subscription;
pub use queue::{clear_error_handler, set_error_handler, start_batch, BatchGuard};
pub use reaction::{autorun, when, Reaction};

/// Run `f` inside a batch: writes it performs are collected and drained
/// once, when the outermost batch closes.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    let _guard = queue::start_batch();
    f()
}

/// Evaluate `f` through an anonymous computed node and return its value.
///
/// Inside a reaction this differs from calling `f` inline: the wrapper
/// node diffs its own result, so the enclosing reaction re-runs only when
/// the result changes, not on every write to what `f` reads.
pub fn expr<T>(f: impl Fn() -> T + Send + Sync + 'static) -> T
where
    T: PartialEq + Clone + Send + Sync + 'static,
{
    Computed::new(f).get()
}

/// [`expr`] with a caller-supplied equality comparator.
pub fn expr_with_comparator<T>(
    f: impl Fn() -> T + Send + Sync + 'static,
    equal: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
) -> T
where
    T: Clone + Send + Sync + 'static,
{
    Computed::with_comparator(f, equal).get()
}
