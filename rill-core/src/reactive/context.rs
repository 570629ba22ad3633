//! Reactive Context
//!
//! The reactive context tracks which reader is currently running. This
//! enables automatic dependency tracking: when an atom or derivation is read,
//! the current reader is recorded as one of its dependents.
//!
//! # Implementation
//!
//! We use a thread-local stack. Entering a reader (evaluating a computed,
//! rendering a host context) pushes it; dropping the returned guard pops it.
//! An entry may also be empty, which is how reads are made untracked inside
//! an otherwise tracked evaluation.

use std::cell::RefCell;

use crate::graph::{NodeId, Reader};

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Option<Reader>>> = const { RefCell::new(Vec::new()) };
}

/// Guard that pops the context when dropped.
///
/// This keeps the stack balanced even if the evaluation panics.
pub(crate) struct ReactiveContext {
    reader: Option<NodeId>,
}

impl ReactiveContext {
    /// Make `reader` the current reader until the guard is dropped.
    pub(crate) fn enter(reader: Reader) -> Self {
        let id = reader.id();
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(Some(reader)));
        Self { reader: Some(id) }
    }

    /// Suspend tracking until the guard is dropped.
    pub(crate) fn untracked() -> Self {
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(None));
        Self { reader: None }
    }

    /// The reader that reads are currently attributed to.
    pub(crate) fn current() -> Option<Reader> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().cloned().flatten())
    }

    pub(crate) fn current_id() -> Option<NodeId> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().and_then(|r| r.as_ref().map(Reader::id)))
    }

    /// Whether the current reader is a derivation (not a host context).
    pub(crate) fn in_derivation() -> bool {
        CONTEXT_STACK.with(|stack| matches!(stack.borrow().last(), Some(Some(Reader::Derivation(_)))))
    }

    pub(crate) fn is_active() -> bool {
        Self::current_id().is_some()
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        let popped = CONTEXT_STACK.with(|stack| stack.borrow_mut().pop());

        // Contexts must be dropped in the order they were entered.
        if let Some(entry) = popped {
            debug_assert_eq!(
                entry.as_ref().map(Reader::id),
                self.reader,
                "ReactiveContext mismatch"
            );
        }
    }
}

/// Run `f` without recording any reads.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _guard = ReactiveContext::untracked();
    f()
}
