//! Error Taxonomy
//!
//! Two families of failure exist in the engine:
//!
//! - `GraphError`: programming errors that fail fast at the call site
//!   (cross-thread access, draining the queue while a capture scope is
//!   active). These surface as panics with the error's display text.
//!
//! - `EvalError`: a failure raised by user code inside a tracked
//!   expression. These are captured at the derivation boundary, cached,
//!   and redelivered to every reader until the node recomputes to a
//!   non-failing result. Identity is structural (kind + message + origin),
//!   so two evaluations that fail the same way compare equal and do not
//!   re-trigger downstream propagation.
//!
//! Captured failures travel as typed panic payloads. When a computed node
//! reads a failing dependency, the payload it catches is already an
//! `EvalError` and keeps the origin of the node that first failed.

use std::any::Any;

use thiserror::Error;

use crate::node::NodeId;

/// Fail-fast programming errors.
///
/// These are never captured or cached; they panic at the offending call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A derivation's evaluation read itself, directly or transitively.
    #[error("circular dependency: derivation re-entered its own evaluation")]
    CircularDependency,

    /// A node was accessed from a thread other than the one it was
    /// created on.
    #[error("cannot access a node from a thread other than its owner")]
    CrossThreadAccess,

    /// The work queue was asked to drain while a dependency-capture scope
    /// was active. Capturing reads must never re-enter the scheduler.
    #[error("cannot drain the work queue while a dependency capture is active")]
    DrainDuringCapture,
}

/// What kind of failure an `EvalError` represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// User code panicked inside a tracked expression.
    Panic,

    /// The expression re-entered a node that was already computing.
    CircularDependency,
}

/// A captured evaluation failure.
///
/// Equality is structural: two failures with the same kind, message, and
/// origin node compare equal. This is what gates re-propagation when a
/// computed node fails the same way twice in a row.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("evaluation failed at node {}: {message}", origin.raw())]
pub struct EvalError {
    /// The node whose evaluation first raised this failure.
    pub origin: NodeId,

    /// The failure kind.
    pub kind: FailureKind,

    /// The panic message, or a placeholder for non-string payloads.
    pub message: String,
}

impl EvalError {
    pub(crate) fn circular(origin: NodeId) -> Self {
        Self {
            origin,
            kind: FailureKind::CircularDependency,
            message: GraphError::CircularDependency.to_string(),
        }
    }

    /// Convert a caught panic payload into an `EvalError`.
    ///
    /// A payload that is already an `EvalError` (a failure propagating out
    /// of a nested derivation) is passed through unchanged so its origin
    /// survives; string payloads keep their message.
    pub(crate) fn from_panic(origin: NodeId, payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<EvalError>() {
            Ok(err) => return *err,
            Err(other) => other,
        };
        let message = match payload.downcast::<String>() {
            Ok(msg) => *msg,
            Err(other) => match other.downcast::<&'static str>() {
                Ok(msg) => (*msg).to_string(),
                Err(_) => "panic with non-string payload".to_string(),
            },
        };
        Self {
            origin,
            kind: FailureKind::Panic,
            message,
        }
    }

    /// Redeliver this failure to the caller as a typed panic payload.
    pub(crate) fn into_panic(self) -> ! {
        std::panic::panic_any(self)
    }
}
