//! Atoms
//!
//! An atom is the smallest observable unit: a node that knows which readers
//! touched it and can tell them it changed. Atoms hold no value themselves.
//! [`ObservableValue`] pairs an atom with a value cell, and the containers in
//! [`crate::observable`] use one or more atoms for their structure.
//!
//! # How Atoms Work
//!
//! 1. A read calls [`AtomCore::mark_usage`], which records an edge between the
//!    atom and the current reader (if any).
//! 2. A write that changes the value calls [`AtomCore::invalidate`]. Every
//!    reader is removed from the atom's reader set and notified. A reader that
//!    still cares will read the atom again during its next evaluation.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::{Serialize, Serializer};
use tracing::trace;

use crate::error::{Error, Result};
use crate::graph::{self, Edges, NodeId, Source, WeakReader};
use crate::observable::{Enhance, Enhancer};

/// The observable node behind every value cell and container.
pub(crate) struct AtomCore {
    id: NodeId,
    readers: RefCell<Edges<WeakReader>>,
}

impl AtomCore {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            id: NodeId::new(),
            readers: RefCell::new(Edges::new()),
        })
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    /// Record a read by the current reader.
    pub(crate) fn mark_usage(self: &Rc<Self>) {
        graph::track(self.id, || Source::Atom(self.clone()), &self.readers);
    }

    /// Notify and forget every reader.
    pub(crate) fn invalidate(&self) -> Result<()> {
        let readers = std::mem::take(&mut *self.readers.borrow_mut());
        if readers.is_empty() {
            return Ok(());
        }
        trace!(atom = self.id.raw(), readers = readers.len(), "atom invalidated");
        graph::notify_readers(self.id, readers)
    }

    pub(crate) fn remove_reader(&self, reader: NodeId) {
        self.readers.borrow_mut().shift_remove(&reader);
    }

    pub(crate) fn reader_count(&self) -> usize {
        self.readers.borrow().len()
    }
}

type Accessor<T> = dyn Fn(Option<T>) -> Result<T>;

struct ValueCell<T> {
    atom: Rc<AtomCore>,
    value: RefCell<T>,
    enhancer: Enhancer,
    prop: RefCell<Option<Weak<Accessor<T>>>>,
}

/// A single observable value.
///
/// Cloning the handle shares the value.
///
/// # Example
///
/// ```rust
/// use rill_core::reactive::ObservableValue;
///
/// let count = ObservableValue::new(0);
/// count.set(5).unwrap();
/// assert_eq!(count.get(), 5);
/// ```
pub struct ObservableValue<T> {
    inner: Rc<ValueCell<T>>,
}

impl<T> Clone for ObservableValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Enhance> ObservableValue<T> {
    /// Create a value with the deep enhancer.
    pub fn new(value: T) -> Self {
        Self::raw(Enhancer::Deep.store(value), Enhancer::Deep)
    }

    /// Create a value with the given enhancer applied to the initial value.
    pub fn with_enhancer(value: T, enhancer: Enhancer) -> Result<Self> {
        let value = enhancer.apply(value, None)?;
        Ok(Self::raw(value, enhancer))
    }

    /// Store `value` as given; later writes go through `enhancer`.
    pub(crate) fn raw(value: T, enhancer: Enhancer) -> Self {
        Self {
            inner: Rc::new(ValueCell {
                atom: AtomCore::new(),
                value: RefCell::new(value),
                enhancer,
                prop: RefCell::new(None),
            }),
        }
    }

    /// The underlying atom's node id.
    pub fn id(&self) -> NodeId {
        self.inner.atom.id()
    }

    /// The enhancer applied to writes.
    pub fn enhancer(&self) -> Enhancer {
        self.inner.enhancer
    }

    /// Get the current value, recording the read.
    pub fn get(&self) -> T {
        self.inner.atom.mark_usage();
        self.inner.value.borrow().clone()
    }

    /// Borrow the current value, recording the read.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.inner.atom.mark_usage();
        f(&*self.inner.value.borrow())
    }

    /// Get the current value without recording the read.
    pub fn get_untracked(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Write a new value.
    ///
    /// The value is passed through the enhancer first. Readers are notified
    /// only when the enhanced value is not the same as the stored one. If a
    /// reader is in the middle of evaluating, the write is rejected with
    /// [`Error::ModifiedDuringUpdate`](crate::Error::ModifiedDuringUpdate)
    /// and the old value is kept. Writing from inside [`with`](Self::with)
    /// fails with [`Error::BorrowedDuringWrite`].
    pub fn set(&self, value: T) -> Result<()> {
        let enhanced = {
            let current = self.inner.value.borrow();
            let enhanced = self.inner.enhancer.apply(value, Some(&*current))?;
            if enhanced.same_value(&*current) {
                return Ok(());
            }
            enhanced
        };
        if self.inner.value.try_borrow_mut().is_err() {
            return Err(Error::BorrowedDuringWrite);
        }
        self.inner.atom.invalidate()?;
        let mut slot = self
            .inner
            .value
            .try_borrow_mut()
            .map_err(|_| Error::BorrowedDuringWrite)?;
        *slot = enhanced;
        Ok(())
    }

    /// Write a value computed from the current one.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> Result<()> {
        let current = self.get_untracked();
        self.set(f(&current))
    }

    /// Notify readers without changing the value.
    pub fn invalidate(&self) -> Result<()> {
        self.inner.atom.invalidate()
    }

    /// A getter/setter bound to this value.
    ///
    /// While any handle to it is alive, every call returns the same prop.
    pub fn prop(&self) -> Prop<T> {
        let cached = self.inner.prop.borrow().as_ref().and_then(Weak::upgrade);
        if let Some(accessor) = cached {
            return Prop { accessor };
        }
        let this = self.clone();
        let prop = Prop::new(move |value| {
            if let Some(value) = value {
                this.set(value)?;
                return Ok(this.get_untracked());
            }
            Ok(this.get())
        });
        *self.inner.prop.borrow_mut() = Some(Rc::downgrade(&prop.accessor));
        prop
    }

    /// Number of readers currently depending on this value.
    pub fn reader_count(&self) -> usize {
        self.inner.atom.reader_count()
    }

    /// Whether both handles share one value.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Enhance + fmt::Debug> fmt::Debug for ObservableValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableValue")
            .field("id", &self.id())
            .field("value", &*self.inner.value.borrow())
            .field("enhancer", &self.inner.enhancer)
            .finish()
    }
}

impl<T: Enhance + Serialize> Serialize for ObservableValue<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}

/// A getter/setter pair over some observable slot.
///
/// Calling with `None` reads; calling with `Some(value)` writes and returns
/// the stored value.
pub struct Prop<T> {
    accessor: Rc<Accessor<T>>,
}

impl<T> Clone for Prop<T> {
    fn clone(&self) -> Self {
        Self {
            accessor: self.accessor.clone(),
        }
    }
}

impl<T> Prop<T> {
    /// A prop backed by `accessor`.
    pub fn new(accessor: impl Fn(Option<T>) -> Result<T> + 'static) -> Self {
        Self {
            accessor: Rc::new(accessor),
        }
    }

    /// Read with `None`, write with `Some(value)`.
    pub fn call(&self, value: Option<T>) -> Result<T> {
        (self.accessor)(value)
    }

    /// Read through the prop.
    pub fn get(&self) -> Result<T> {
        self.call(None)
    }

    /// Write through the prop, returning the stored value.
    pub fn set(&self, value: T) -> Result<T> {
        self.call(Some(value))
    }

    /// Whether both props share one accessor.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.accessor, &other.accessor)
    }
}

impl<T> fmt::Debug for Prop<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Prop")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::host::HostContext;

    #[test]
    fn value_get_set() {
        let value = ObservableValue::new(42);
        assert_eq!(value.get(), 42);

        value.set(100).unwrap();
        assert_eq!(value.get(), 100);
    }

    #[test]
    fn value_update() {
        let value = ObservableValue::new(10);
        value.update(|x| x + 5).unwrap();
        assert_eq!(value.get(), 15);
    }

    #[test]
    fn unchanged_write_keeps_readers() {
        let ctx = HostContext::new();
        let value = ObservableValue::new(String::from("a"));
        ctx.track(|| value.get());

        value.set(String::from("a")).unwrap();
        assert!(!ctx.is_invalidated());
        assert_eq!(value.reader_count(), 1);

        value.set(String::from("b")).unwrap();
        assert!(ctx.is_invalidated());
        assert_eq!(value.reader_count(), 0);
    }

    #[test]
    fn nan_is_same_as_nan() {
        let ctx = HostContext::new();
        let value = ObservableValue::new(f64::NAN);
        ctx.track(|| value.get());

        value.set(f64::NAN).unwrap();
        assert!(!ctx.is_invalidated());
    }

    #[test]
    fn prop_reads_and_writes() {
        let value = ObservableValue::new(1);
        let prop = value.prop();
        assert_eq!(prop.get().unwrap(), 1);
        assert_eq!(prop.set(7).unwrap(), 7);
        assert_eq!(value.get(), 7);
    }

    #[test]
    fn prop_is_shared_while_alive() {
        let value = ObservableValue::new(1);
        let first = value.prop();
        assert!(first.ptr_eq(&value.prop()));

        drop(first);
        let second = value.prop();
        second.set(3).unwrap();
        assert!(second.ptr_eq(&value.prop()));
        assert_eq!(value.get(), 3);
    }

    #[test]
    fn write_inside_borrow_is_refused() {
        let value = ObservableValue::new(1);
        let result = value.with(|current| value.set(*current + 1));
        assert_eq!(result, Err(Error::BorrowedDuringWrite));
        assert_eq!(value.get(), 1);

        assert!(value.with(|current| value.set(*current)).is_ok());
        value
            .update(|current| {
                value.set(10).unwrap();
                current * 2
            })
            .unwrap();
        assert_eq!(value.get(), 2);
    }

    #[test]
    fn clone_shares_state() {
        let a = ObservableValue::new(1);
        let b = a.clone();
        b.set(2).unwrap();
        assert_eq!(a.get(), 2);
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn serializes_current_value() {
        let value = ObservableValue::new(vec![1, 2, 3]);
        assert_eq!(serde_json::to_string(&value).unwrap(), "[1,2,3]");
    }
}
