//! Observable Maps
//!
//! A map keeps one observable value per key plus a structure atom.
//!
//! - Reading a present key marks only that key's value.
//! - Probing an absent key marks the structure atom, so adding the key later
//!   reaches whoever saw it missing.
//! - Adding, deleting and clearing keys invalidate the structure atom;
//!   deleting and clearing also invalidate the removed values.
//! - Size and iteration mark the structure atom.

use std::cell::RefCell;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::{Error, Result};
use crate::graph::NodeId;
use crate::reactive::atom::AtomCore;
use crate::reactive::{ObservableValue, Prop};

use super::enhancer::{Enhance, Enhancer, SameValue};
use super::value::Value;

struct MapInner<K, V> {
    atom: Rc<AtomCore>,
    content: RefCell<IndexMap<K, ObservableValue<V>>>,
    enhancer: Enhancer,
}

/// An observable keyed collection. Iteration follows insertion order.
///
/// # Example
///
/// ```rust
/// use rill_core::observable::ObservableMap;
///
/// let scores = ObservableMap::new();
/// scores.set("ann", 3).unwrap();
/// assert_eq!(scores.get(&"ann"), Some(3));
/// assert!(!scores.has(&"bob"));
/// ```
pub struct ObservableMap<K, V> {
    inner: Rc<MapInner<K, V>>,
}

impl<K, V> Clone for ObservableMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> ObservableMap<K, V> {
    /// The node id of the structure atom.
    pub fn id(&self) -> NodeId {
        self.inner.atom.id()
    }

    /// The enhancer applied to written values.
    pub fn enhancer(&self) -> Enhancer {
        self.inner.enhancer
    }

    /// Whether both handles refer to the same map.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.inner) as *const () as usize
    }

    /// Number of readers watching the map's structure.
    pub fn reader_count(&self) -> usize {
        self.inner.atom.reader_count()
    }
}

impl<K, V> ObservableMap<K, V>
where
    K: Hash + Eq + Clone + 'static,
    V: Enhance,
{
    /// An empty map with the deep enhancer.
    pub fn new() -> Self {
        Self::with_enhancer(Enhancer::Deep)
    }

    /// An empty map whose values are written through `enhancer`.
    pub fn with_enhancer(enhancer: Enhancer) -> Self {
        Self {
            inner: Rc::new(MapInner {
                atom: AtomCore::new(),
                content: RefCell::new(IndexMap::new()),
                enhancer,
            }),
        }
    }

    /// Build a map from entries, passing every value through `enhancer`.
    pub fn from_entries(entries: impl IntoIterator<Item = (K, V)>, enhancer: Enhancer) -> Result<Self> {
        let map = Self::with_enhancer(enhancer);
        for (key, value) in entries {
            map.set(key, value)?;
        }
        Ok(map)
    }

    pub(crate) fn observed(entries: impl IntoIterator<Item = (K, V)>, enhancer: Enhancer) -> Self {
        let map = Self::with_enhancer(enhancer);
        {
            let mut content = map.inner.content.borrow_mut();
            for (key, value) in entries {
                content.insert(key, ObservableValue::raw(enhancer.store(value), enhancer));
            }
        }
        map
    }

    fn slot(&self, key: &K) -> Option<ObservableValue<V>> {
        self.inner.content.borrow().get(key).cloned()
    }

    /// Number of entries, recording a read of the structure.
    pub fn size(&self) -> usize {
        self.inner.atom.mark_usage();
        self.inner.content.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether `key` is present. Only changes to that key notify the reader.
    pub fn has(&self, key: &K) -> bool {
        match self.slot(key) {
            Some(slot) => {
                slot.with(|_| ());
                true
            }
            None => {
                self.inner.atom.mark_usage();
                false
            }
        }
    }

    /// The value at `key`, recording a read of that key only.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.slot(key) {
            Some(slot) => Some(slot.get()),
            None => {
                self.inner.atom.mark_usage();
                None
            }
        }
    }

    /// Write `value` under `key`. Only a new key changes the structure.
    pub fn set(&self, key: K, value: V) -> Result<()> {
        if let Some(slot) = self.slot(&key) {
            return slot.set(value);
        }
        let slot = ObservableValue::with_enhancer(value, self.inner.enhancer)?;
        self.inner.atom.invalidate()?;
        self.inner.content.borrow_mut().insert(key, slot);
        Ok(())
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, key: &K) -> Result<bool> {
        self.inner.atom.invalidate()?;
        let Some(slot) = self.slot(key) else {
            return Ok(false);
        };
        slot.invalidate()?;
        self.inner.content.borrow_mut().shift_remove(key);
        Ok(true)
    }

    /// Remove every entry, notifying every value reader.
    pub fn clear(&self) -> Result<()> {
        let slots: Vec<ObservableValue<V>> = self.inner.content.borrow().values().cloned().collect();
        if slots.is_empty() {
            return Ok(());
        }
        for slot in &slots {
            slot.invalidate()?;
        }
        self.inner.atom.invalidate()?;
        self.inner.content.borrow_mut().clear();
        Ok(())
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Vec<K> {
        self.inner.atom.mark_usage();
        self.inner.content.borrow().keys().cloned().collect()
    }

    /// Current values, recording a read of each.
    pub fn values(&self) -> Vec<V> {
        self.entries().into_iter().map(|(_, value)| value).collect()
    }

    /// Current entries, recording a read of each value.
    pub fn entries(&self) -> Vec<(K, V)> {
        self.inner.atom.mark_usage();
        let slots: Vec<(K, ObservableValue<V>)> = self
            .inner
            .content
            .borrow()
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();
        slots.into_iter().map(|(key, slot)| (key, slot.get())).collect()
    }

    /// Call `f` with each value and its key.
    pub fn for_each(&self, mut f: impl FnMut(&V, &K)) {
        for (key, value) in self.entries() {
            f(&value, &key);
        }
    }

    /// Entries without recording any read.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        self.inner
            .content
            .borrow()
            .iter()
            .map(|(key, slot)| (key.clone(), slot.get_untracked()))
            .collect()
    }

    /// A getter/setter bound to `key`. Writing `None` deletes the key.
    pub fn prop(&self, key: K) -> Prop<Option<V>> {
        if let Some(slot) = self.slot(&key) {
            slot.with(|_| ());
        } else {
            self.inner.atom.mark_usage();
        }
        let this = self.clone();
        Prop::new(move |value: Option<Option<V>>| {
            match value {
                Some(Some(value)) => this.set(key.clone(), value)?,
                Some(None) => {
                    this.delete(&key)?;
                }
                None => {}
            }
            Ok(this.get(&key))
        })
    }
}

impl ObservableMap<Value, Value> {
    /// Build a map from a dynamic value: a dictionary, a record, another
    /// map, an object, or a list of `[key, value]` pairs. `Null` gives an
    /// empty map.
    pub fn from_value(source: &Value, enhancer: Enhancer) -> Result<Self> {
        let entries: Vec<(Value, Value)> = match source {
            Value::Null => Vec::new(),
            Value::List(items) => pairs(items.iter().cloned())?,
            Value::Array(array) => pairs(array.snapshot())?,
            other => other
                .entries_untracked()
                .ok_or(Error::UnsupportedMapSource { kind: other.kind() })?,
        };
        Self::from_entries(entries, enhancer)
    }
}

fn pairs(items: impl IntoIterator<Item = Value>) -> Result<Vec<(Value, Value)>> {
    items
        .into_iter()
        .map(|item| match item.items_untracked().as_deref() {
            Some([key, value]) => Ok((key.clone(), value.clone())),
            _ => Err(Error::UnsupportedMapSource { kind: item.kind() }),
        })
        .collect()
}

impl<K, V> Default for ObservableMap<K, V>
where
    K: Hash + Eq + Clone + 'static,
    V: Enhance,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SameValue for ObservableMap<K, V>
where
    K: Hash + Eq + Clone + 'static,
    V: Enhance,
{
    fn same_value(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }

    fn deep_equal(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let theirs: IndexMap<K, V> = other.snapshot().into_iter().collect();
        let ours = self.snapshot();
        ours.len() == theirs.len()
            && ours.iter().all(|(key, value)| {
                theirs
                    .get(key)
                    .is_some_and(|other| value.deep_equal(other))
            })
    }
}

impl<K, V> Enhance for ObservableMap<K, V>
where
    K: Hash + Eq + Clone + 'static,
    V: Enhance,
{
    fn observe(self, _children: Enhancer) -> std::result::Result<Self, Self> {
        Ok(self)
    }
}

impl<K: fmt::Debug, V: Enhance + fmt::Debug> fmt::Debug for ObservableMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let content = self.inner.content.borrow();
        f.debug_map()
            .entries(content.iter().map(|(key, slot)| (key, slot.get_untracked())))
            .finish()
    }
}

impl<K: Serialize, V: Enhance + Serialize> Serialize for ObservableMap<K, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let content = self.inner.content.borrow();
        let mut map = serializer.serialize_map(Some(content.len()))?;
        for (key, slot) in content.iter() {
            map.serialize_entry(key, &slot.get_untracked())?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::HostContext;

    #[test]
    fn absent_probe_sees_later_insert() {
        let ctx = HostContext::new();
        let map: ObservableMap<&str, i32> = ObservableMap::new();
        ctx.track(|| map.has(&"a"));

        map.set("a", 1).unwrap();
        assert!(ctx.is_invalidated());
    }

    #[test]
    fn present_key_read_ignores_other_inserts() {
        let ctx = HostContext::new();
        let map = ObservableMap::from_entries([("a", 1)], Enhancer::Deep).unwrap();
        ctx.track(|| map.get(&"a"));

        map.set("b", 2).unwrap();
        assert!(!ctx.is_invalidated());
        map.set("a", 1).unwrap();
        assert!(!ctx.is_invalidated());
        map.set("a", 5).unwrap();
        assert!(ctx.is_invalidated());
    }

    #[test]
    fn delete_and_clear_notify_value_readers() {
        let map = ObservableMap::from_entries([("a", 1), ("b", 2)], Enhancer::Deep).unwrap();
        let reader_a = HostContext::new();
        reader_a.track(|| map.get(&"a"));
        let reader_b = HostContext::new();
        reader_b.track(|| map.get(&"b"));

        assert!(map.delete(&"a").unwrap());
        assert!(reader_a.is_invalidated());
        assert!(!reader_b.is_invalidated());
        assert!(!map.delete(&"zzz").unwrap());

        map.clear().unwrap();
        assert!(reader_b.is_invalidated());
        assert_eq!(map.size(), 0);
    }

    #[test]
    fn iteration_keeps_insertion_order() {
        let map = ObservableMap::new();
        map.set(3, "c").unwrap();
        map.set(1, "a").unwrap();
        map.set(2, "b").unwrap();
        assert_eq!(map.keys(), vec![3, 1, 2]);
        assert_eq!(map.values(), vec!["c", "a", "b"]);

        let mut seen = Vec::new();
        map.for_each(|value, key| seen.push((*key, *value)));
        assert_eq!(seen, vec![(3, "c"), (1, "a"), (2, "b")]);
    }

    #[test]
    fn prop_reads_writes_and_deletes() {
        let map = ObservableMap::new();
        let prop = map.prop("k");
        assert_eq!(prop.get().unwrap(), None);
        assert_eq!(prop.set(Some(4)).unwrap(), Some(4));
        assert_eq!(map.get(&"k"), Some(4));
        assert_eq!(prop.set(None).unwrap(), None);
        assert!(!map.has(&"k"));
    }

    #[test]
    fn init_from_dynamic_values() {
        let record = Value::record([("x", Value::from(1)), ("y", Value::from(2))]);
        let map = ObservableMap::from_value(&record, Enhancer::Deep).unwrap();
        assert_eq!(map.get(&Value::from("y")), Some(Value::from(2)));

        let pairs = Value::list([Value::list([Value::from(1), Value::from("one")])]);
        let map = ObservableMap::from_value(&pairs, Enhancer::Deep).unwrap();
        assert_eq!(map.get(&Value::from(1)), Some(Value::from("one")));

        assert_eq!(
            ObservableMap::from_value(&Value::from(5), Enhancer::Deep).err(),
            Some(Error::UnsupportedMapSource { kind: "number" })
        );
    }
}
