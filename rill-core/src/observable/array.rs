//! Observable Arrays
//!
//! An array is a vector guarded by one structure atom. Every read marks the
//! atom; every mutation that changes something invalidates it.
//!
//! # How Mutations Work
//!
//! [`ObservableArray::splice`] is the primitive. `push`, `pop`, `shift`,
//! `unshift`, `remove`, `clear`, `replace` and `move_item` are all written in
//! terms of it. Indexes follow the usual sequence conventions: a negative
//! start counts from the end, and both the start and the delete count are
//! clamped to the array.
//!
//! New items pass through the array's enhancer before they are stored.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use serde::ser::{Serialize, SerializeSeq, Serializer};

use crate::error::{Error, Result};
use crate::graph::NodeId;
use crate::reactive::atom::AtomCore;
use crate::reactive::Prop;

use super::enhancer::{Enhance, Enhancer, SameValue};

/// Resolve a possibly negative index against `len`, clamped to `0..=len`.
fn clamp_index(index: isize, len: usize) -> usize {
    if index < 0 {
        len.saturating_sub(index.unsigned_abs())
    } else {
        index.unsigned_abs().min(len)
    }
}

struct ArrayInner<T> {
    atom: Rc<AtomCore>,
    values: RefCell<Vec<T>>,
    enhancer: Enhancer,
}

/// An observable vector.
///
/// # Example
///
/// ```rust
/// use rill_core::observable::ObservableArray;
///
/// let list = ObservableArray::from(vec![1, 2, 3]);
/// list.push(4).unwrap();
/// list.move_item(0, 3).unwrap();
/// assert_eq!(list.to_vec(), vec![2, 3, 4, 1]);
/// ```
pub struct ObservableArray<T> {
    inner: Rc<ArrayInner<T>>,
}

impl<T> Clone for ObservableArray<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> ObservableArray<T> {
    /// The node id of the structure atom.
    pub fn id(&self) -> NodeId {
        self.inner.atom.id()
    }

    /// The enhancer applied to written items.
    pub fn enhancer(&self) -> Enhancer {
        self.inner.enhancer
    }

    /// Whether both handles refer to the same array.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.inner) as *const () as usize
    }

    /// Number of readers currently depending on the array.
    pub fn reader_count(&self) -> usize {
        self.inner.atom.reader_count()
    }

    pub(crate) fn len_untracked(&self) -> usize {
        self.inner.values.borrow().len()
    }

    fn mark(&self) {
        self.inner.atom.mark_usage();
    }
}

impl<T: Enhance> ObservableArray<T> {
    /// An empty array with the deep enhancer.
    pub fn new() -> Self {
        Self::with_enhancer(Enhancer::Deep)
    }

    /// An empty array whose items are written through `enhancer`.
    pub fn with_enhancer(enhancer: Enhancer) -> Self {
        Self::observed(Vec::new(), enhancer)
    }

    /// Build an array, passing every item through `enhancer`.
    pub fn from_vec(items: Vec<T>, enhancer: Enhancer) -> Result<Self> {
        let items = items
            .into_iter()
            .map(|item| enhancer.apply(item, None))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::raw(items, enhancer))
    }

    /// Build an array whose items are stored as children of `enhancer`
    /// structure.
    pub(crate) fn observed(items: Vec<T>, enhancer: Enhancer) -> Self {
        let items = items.into_iter().map(|item| enhancer.store(item)).collect();
        Self::raw(items, enhancer)
    }

    fn raw(items: Vec<T>, enhancer: Enhancer) -> Self {
        Self {
            inner: Rc::new(ArrayInner {
                atom: AtomCore::new(),
                values: RefCell::new(items),
                enhancer,
            }),
        }
    }

    fn enhance_all(&self, items: Vec<T>) -> Result<Vec<T>> {
        items
            .into_iter()
            .map(|item| self.inner.enhancer.apply(item, None))
            .collect()
    }

    // ---- Reads ----

    /// Number of items, recording a read.
    pub fn len(&self) -> usize {
        self.mark();
        self.len_untracked()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The item at `index`, recording a read.
    pub fn get(&self, index: usize) -> Option<T> {
        self.mark();
        self.inner.values.borrow().get(index).cloned()
    }

    /// Copy of the current items, recording the read.
    pub fn to_vec(&self) -> Vec<T> {
        self.mark();
        self.snapshot()
    }

    /// Copy of the current items without recording the read.
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.values.borrow().clone()
    }

    /// Position of the first item that is the same as `value`.
    pub fn index_of(&self, value: &T) -> Option<usize> {
        self.mark();
        self.inner
            .values
            .borrow()
            .iter()
            .position(|item| item.same_value(value))
    }

    /// Whether some item is the same as `value`.
    pub fn includes(&self, value: &T) -> bool {
        self.index_of(value).is_some()
    }

    /// First item matching `predicate`.
    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        self.to_vec().into_iter().find(|item| predicate(item))
    }

    /// Position of the first item matching `predicate`.
    pub fn find_index(&self, predicate: impl FnMut(&T) -> bool) -> Option<usize> {
        self.to_vec().iter().position(predicate)
    }

    /// Whether any item matches `predicate`.
    pub fn some(&self, predicate: impl FnMut(&T) -> bool) -> bool {
        self.to_vec().iter().any(predicate)
    }

    /// Whether every item matches `predicate`.
    pub fn every(&self, predicate: impl FnMut(&T) -> bool) -> bool {
        self.to_vec().iter().all(predicate)
    }

    /// Fold the items from the front.
    pub fn fold<A>(&self, init: A, f: impl FnMut(A, &T) -> A) -> A {
        self.to_vec().iter().fold(init, f)
    }

    /// Call `f` with each item and its index.
    pub fn for_each(&self, mut f: impl FnMut(&T, usize)) {
        for (index, item) in self.to_vec().iter().enumerate() {
            f(item, index);
        }
    }

    /// Map each item into a plain vector.
    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> Vec<U> {
        self.to_vec().iter().map(f).collect()
    }

    /// Items matching `predicate`, as a plain vector.
    pub fn filter(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        self.to_vec().into_iter().filter(|item| predicate(item)).collect()
    }

    /// Items in `start..end`, with negative bounds counting from the end.
    pub fn slice(&self, start: isize, end: Option<isize>) -> Vec<T> {
        self.mark();
        let values = self.inner.values.borrow();
        let len = values.len();
        let start = clamp_index(start, len);
        let end = end.map_or(len, |end| clamp_index(end, len));
        if start >= end {
            return Vec::new();
        }
        values[start..end].to_vec()
    }

    /// Render the items joined by `separator`.
    pub fn join(&self, separator: &str) -> String
    where
        T: fmt::Display,
    {
        self.mark();
        let values = self.inner.values.borrow();
        let mut joined = String::new();
        for (index, item) in values.iter().enumerate() {
            if index > 0 {
                joined.push_str(separator);
            }
            joined.push_str(&item.to_string());
        }
        joined
    }

    // ---- Mutations ----

    /// Remove `delete_count` items at `index` and insert `items` there.
    ///
    /// `None` deletes everything from `index` on. Returns the removed items.
    /// A call that neither removes nor inserts only records a read.
    pub fn splice(&self, index: isize, delete_count: Option<usize>, items: Vec<T>) -> Result<Vec<T>> {
        let len = self.len_untracked();
        let start = clamp_index(index, len);
        let delete = delete_count.map_or(len - start, |count| count.min(len - start));
        let items = self.enhance_all(items)?;
        if items.is_empty() && delete == 0 {
            self.mark();
            return Ok(Vec::new());
        }
        self.inner.atom.invalidate()?;
        let removed = self
            .inner
            .values
            .borrow_mut()
            .splice(start..start + delete, items)
            .collect();
        Ok(removed)
    }

    /// Write the item at `index`. Writing at `len` appends.
    pub fn set(&self, index: usize, value: T) -> Result<()> {
        let len = self.len_untracked();
        if index == len {
            return self.push(value).map(|_| ());
        }
        if index > len {
            return Err(Error::IndexOutOfBounds { index, len });
        }
        let enhanced = {
            let values = self.inner.values.borrow();
            let current = &values[index];
            let enhanced = self.inner.enhancer.apply(value, Some(current))?;
            if enhanced.same_value(current) {
                return Ok(());
            }
            enhanced
        };
        self.inner.atom.invalidate()?;
        self.inner.values.borrow_mut()[index] = enhanced;
        Ok(())
    }

    /// Append an item. Returns the new length.
    pub fn push(&self, value: T) -> Result<usize> {
        self.extend(vec![value])
    }

    /// Append items. Returns the new length.
    pub fn extend(&self, items: Vec<T>) -> Result<usize> {
        let len = self.len_untracked();
        self.splice(len as isize, Some(0), items)?;
        Ok(self.len_untracked())
    }

    /// Remove and return the last item.
    pub fn pop(&self) -> Result<Option<T>> {
        Ok(self.splice(-1, None, Vec::new())?.pop())
    }

    /// Remove and return the first item.
    pub fn shift(&self) -> Result<Option<T>> {
        Ok(self.splice(0, Some(1), Vec::new())?.into_iter().next())
    }

    /// Prepend items. Returns the new length.
    pub fn unshift(&self, items: Vec<T>) -> Result<usize> {
        self.splice(0, Some(0), items)?;
        Ok(self.len_untracked())
    }

    /// Remove the first item that is the same as `value`.
    pub fn remove(&self, value: &T) -> Result<bool> {
        match self.index_of(value) {
            Some(index) => {
                self.splice(index as isize, Some(1), Vec::new())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove every item. Returns the old items.
    pub fn clear(&self) -> Result<Vec<T>> {
        self.splice(0, None, Vec::new())
    }

    /// Replace every item. Returns the old items.
    pub fn replace(&self, items: Vec<T>) -> Result<Vec<T>> {
        self.splice(0, None, items)
    }

    /// Drop items past `len`.
    pub fn truncate(&self, len: usize) -> Result<()> {
        if len >= self.len_untracked() {
            self.mark();
            return Ok(());
        }
        self.splice(len as isize, None, Vec::new()).map(|_| ())
    }

    /// Move the item at `from` so it ends up at `to`.
    ///
    /// Both indexes must be inside the array. The whole array is rebuilt and
    /// replaced in one structural change.
    pub fn move_item(&self, from: usize, to: usize) -> Result<()> {
        let old = self.snapshot();
        let len = old.len();
        for index in [from, to] {
            if index >= len {
                return Err(Error::IndexOutOfBounds { index, len });
            }
        }
        if from == to {
            return Ok(());
        }
        let mut items = Vec::with_capacity(len);
        if from < to {
            items.extend_from_slice(&old[..from]);
            items.extend_from_slice(&old[from + 1..=to]);
            items.push(old[from].clone());
            items.extend_from_slice(&old[to + 1..]);
        } else {
            items.extend_from_slice(&old[..to]);
            items.push(old[from].clone());
            items.extend_from_slice(&old[to..from]);
            items.extend_from_slice(&old[from + 1..]);
        }
        self.replace(items).map(|_| ())
    }

    /// Overwrite `start..end` with `value`, with negative bounds counting
    /// from the end.
    pub fn fill(&self, value: T, start: isize, end: Option<isize>) -> Result<()> {
        let value = self.inner.enhancer.apply(value, None)?;
        let len = self.len_untracked();
        let start = clamp_index(start, len);
        let end = end.map_or(len, |end| clamp_index(end, len));
        if start >= end {
            return Ok(());
        }
        self.inner.atom.invalidate()?;
        let mut values = self.inner.values.borrow_mut();
        for slot in &mut values[start..end] {
            *slot = value.clone();
        }
        Ok(())
    }

    /// Reverse the items in place.
    pub fn reverse(&self) -> Result<()> {
        self.inner.atom.invalidate()?;
        self.inner.values.borrow_mut().reverse();
        Ok(())
    }

    /// Sort in place. `compare` runs on a copy, so it may read the array.
    pub fn sort_by(&self, compare: impl FnMut(&T, &T) -> Ordering) -> Result<()> {
        let mut sorted = self.snapshot();
        sorted.sort_by(compare);
        self.inner.atom.invalidate()?;
        *self.inner.values.borrow_mut() = sorted;
        Ok(())
    }

    /// A getter/setter bound to the item at `index`.
    pub fn prop(&self, index: usize) -> Prop<T> {
        let this = self.clone();
        Prop::new(move |value| {
            if let Some(value) = value {
                this.set(index, value)?;
            }
            let len = this.len_untracked();
            this.get(index).ok_or(Error::IndexOutOfBounds { index, len })
        })
    }
}

impl<T: Enhance> Default for ObservableArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Enhance> From<Vec<T>> for ObservableArray<T> {
    /// Build a deep array.
    fn from(items: Vec<T>) -> Self {
        Self::observed(items, Enhancer::Deep)
    }
}

impl<T: SameValue> SameValue for ObservableArray<T> {
    fn same_value(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }

    fn deep_equal(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let (a, b) = (self.inner.values.borrow(), other.inner.values.borrow());
        a.len() == b.len() && a.iter().zip(b.iter()).all(|(a, b)| a.deep_equal(b))
    }
}

impl<T: Enhance> Enhance for ObservableArray<T> {
    fn observe(self, _children: Enhancer) -> std::result::Result<Self, Self> {
        Ok(self)
    }
}

impl<T: fmt::Debug> fmt::Debug for ObservableArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableArray")
            .field("id", &self.inner.atom.id())
            .field("values", &*self.inner.values.borrow())
            .finish()
    }
}

impl<T: Serialize> Serialize for ObservableArray<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let values = self.inner.values.borrow();
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for item in values.iter() {
            seq.serialize_element(item)?;
        }
        seq.end()
    }
}
