//! Error Types
//!
//! Two kinds of failure flow through the engine:
//!
//! - Usage errors: the caller misused the API (re-entered a computed, wrote to
//!   an input of a computed that is being evaluated, moved an array item out of
//!   bounds, ...). They are returned from the call that caused them.
//!
//! - Computation errors: user code inside a derivation failed. The failure is
//!   cached as the derivation's result and handed back to whoever reads it, so
//!   the same error recurring does not count as a change.

use std::fmt;
use std::rc::Rc;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the reactive engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// A computed value was read while it was computing itself.
    #[error("recursively calling computed value")]
    RecursiveComputed,

    /// An input of a derivation changed while that derivation was evaluating.
    #[error("modifying inputs during updating computed")]
    ModifiedDuringUpdate,

    /// A value was written while a borrow of it was still handed out.
    #[error("writing observable value while it is borrowed")]
    BorrowedDuringWrite,

    /// A derivation-only operation was called from somewhere else.
    #[error("{operation} could be called only from computed")]
    NotInComputed { operation: &'static str },

    /// A derivation-only operation was called from inside a derivation.
    #[error("{operation} cannot be called from computed method")]
    InComputed { operation: &'static str },

    /// An array index was outside `0..len`.
    #[error("array index out of bounds: {index} is not in 0..{len}")]
    IndexOutOfBounds { index: usize, len: usize },

    /// A keyed collection was initialized from a value that has no entries.
    #[error("cannot initialize map from {kind}")]
    UnsupportedMapSource { kind: &'static str },

    /// The shallow enhancer was applied to a primitive value.
    #[error("shallow observable cannot be used for primitive values")]
    ShallowPrimitive,

    /// The per-frame flush loop kept finding work.
    #[error("computed values did not stabilize after {iterations} iterations")]
    DidNotStabilize { iterations: usize },

    /// The derivation was permanently disposed.
    #[error("using disposed computed")]
    Disposed,

    /// Evaluation was skipped because the frame ran out of time budget.
    #[error("computation interrupted before producing a value")]
    Interrupted,

    /// The object owning a computed method no longer exists.
    #[error("owner of computed method was dropped")]
    OwnerDropped,

    /// An awaited value was abandoned before it resolved.
    #[error("awaited value was cancelled")]
    Cancelled,

    /// User code inside a derivation failed.
    #[error(transparent)]
    Computation(#[from] CaughtException),
}

impl Error {
    /// Wrap a user error so it can be returned from a derivation.
    pub fn computation<E>(err: E) -> Self
    where
        E: std::error::Error + 'static,
    {
        Error::Computation(CaughtException::new(err))
    }

    /// Build a computation error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Computation(CaughtException::msg(message))
    }
}

#[derive(Clone)]
enum Cause {
    Error(Rc<dyn std::error::Error>),
    Message(Rc<str>),
}

/// A failure captured from user code and stored as a derivation's result.
///
/// Two exceptions are equal when they share an allocation or render the same
/// message.
#[derive(Clone)]
pub struct CaughtException {
    cause: Cause,
}

impl CaughtException {
    /// Capture `err`, keeping it available as the source.
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + 'static,
    {
        Self {
            cause: Cause::Error(Rc::new(err)),
        }
    }

    /// Capture a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            cause: Cause::Message(message.into().into()),
        }
    }

    /// The wrapped error, if one was captured rather than a message.
    pub fn cause(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.cause {
            Cause::Error(err) => Some(err.as_ref()),
            Cause::Message(_) => None,
        }
    }
}

impl PartialEq for CaughtException {
    fn eq(&self, other: &Self) -> bool {
        match (&self.cause, &other.cause) {
            (Cause::Error(a), Cause::Error(b)) if Rc::ptr_eq(a, b) => true,
            (Cause::Message(a), Cause::Message(b)) if Rc::ptr_eq(a, b) => true,
            _ => self.to_string() == other.to_string(),
        }
    }
}

impl fmt::Display for CaughtException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Cause::Error(err) => fmt::Display::fmt(err, f),
            Cause::Message(message) => f.write_str(message),
        }
    }
}

impl fmt::Debug for CaughtException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CaughtException")
            .field(&self.to_string())
            .finish()
    }
}

impl std::error::Error for CaughtException {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("disk on fire")]
    struct Fire;

    #[test]
    fn same_message_counts_as_same_exception() {
        assert_eq!(Error::msg("boom"), Error::msg("boom"));
        assert_ne!(Error::msg("boom"), Error::msg("bang"));
        assert_eq!(Error::computation(Fire), Error::msg("disk on fire"));
    }

    #[test]
    fn cloned_exception_keeps_cause() {
        let caught = CaughtException::new(Fire);
        let copy = caught.clone();
        assert_eq!(caught, copy);
        assert!(copy.cause().is_some());
        assert!(CaughtException::msg("x").cause().is_none());
    }

    #[test]
    fn usage_errors_render() {
        let err = Error::IndexOutOfBounds { index: 5, len: 2 };
        assert_eq!(err.to_string(), "array index out of bounds: 5 is not in 0..2");
        assert_eq!(
            Error::DidNotStabilize { iterations: 100 }.to_string(),
            "computed values did not stabilize after 100 iterations"
        );
    }
}
