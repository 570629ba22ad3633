//! Observable Objects
//!
//! A record whose fields are observable values, addressed by string keys.
//! Fields added after construction are observable too. Field order follows
//! insertion.
//!
//! Reading a field marks only that field. Reading a missing field, listing
//! keys or asking for the length marks the shape atom, which is invalidated
//! whenever a field is added or deleted.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::Result;
use crate::graph::NodeId;
use crate::reactive::atom::AtomCore;
use crate::reactive::{ObservableValue, Prop};

use super::enhancer::{Enhance, Enhancer, SameValue};
use super::value::Value;

struct ObjectInner {
    shape: Rc<AtomCore>,
    fields: RefCell<IndexMap<String, ObservableValue<Value>>>,
    enhancer: Enhancer,
}

/// An observable record of [`Value`]s.
///
/// # Example
///
/// ```rust
/// use rill_core::observable::{ObservableObject, Value};
///
/// let todo = ObservableObject::new();
/// todo.set("title", Value::from("write docs")).unwrap();
/// assert_eq!(todo.get("title").as_str(), Some("write docs"));
/// assert!(todo.get("done").is_null());
/// ```
#[derive(Clone)]
pub struct ObservableObject {
    inner: Rc<ObjectInner>,
}

impl ObservableObject {
    /// An empty object with the deep enhancer.
    pub fn new() -> Self {
        Self::with_enhancer(Enhancer::Deep)
    }

    /// An empty object whose fields are written through `enhancer`.
    pub fn with_enhancer(enhancer: Enhancer) -> Self {
        Self {
            inner: Rc::new(ObjectInner {
                shape: AtomCore::new(),
                fields: RefCell::new(IndexMap::new()),
                enhancer,
            }),
        }
    }

    /// An object holding `entries`, each stored through `enhancer`.
    pub fn from_entries<K: Into<String>>(
        entries: impl IntoIterator<Item = (K, Value)>,
        enhancer: Enhancer,
    ) -> Result<Self> {
        let object = Self::with_enhancer(enhancer);
        {
            let mut fields = object.inner.fields.borrow_mut();
            for (key, value) in entries {
                let field = ObservableValue::with_enhancer(value, enhancer)?;
                fields.insert(key.into(), field);
            }
        }
        Ok(object)
    }

    pub(crate) fn observed(record: IndexMap<String, Value>, enhancer: Enhancer) -> Self {
        let object = Self::with_enhancer(enhancer);
        object.inner.fields.borrow_mut().extend(
            record
                .into_iter()
                .map(|(key, value)| (key, ObservableValue::raw(enhancer.store(value), enhancer))),
        );
        object
    }

    /// The node id of the object's shape atom.
    pub fn id(&self) -> NodeId {
        self.inner.shape.id()
    }

    /// The enhancer applied to field writes.
    pub fn enhancer(&self) -> Enhancer {
        self.inner.enhancer
    }

    /// Whether both handles refer to the same object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.inner) as *const () as usize
    }

    fn field(&self, key: &str) -> Option<ObservableValue<Value>> {
        self.inner.fields.borrow().get(key).cloned()
    }

    /// Read a field. A missing field reads as [`Value::Null`].
    pub fn get(&self, key: &str) -> Value {
        match self.field(key) {
            Some(field) => field.get(),
            None => {
                self.inner.shape.mark_usage();
                Value::Null
            }
        }
    }

    /// Write a field. Adding a field notifies shape readers.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        if let Some(field) = self.field(&key) {
            return field.set(value);
        }
        let field = ObservableValue::with_enhancer(value, self.inner.enhancer)?;
        self.inner.shape.invalidate()?;
        self.inner.fields.borrow_mut().insert(key, field);
        Ok(())
    }

    /// Whether the field exists. A missing field records a read of the shape.
    pub fn has(&self, key: &str) -> bool {
        match self.field(key) {
            Some(field) => {
                field.with(|_| ());
                true
            }
            None => {
                self.inner.shape.mark_usage();
                false
            }
        }
    }

    /// Remove a field. Returns whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let Some(field) = self.field(key) else {
            return Ok(false);
        };
        field.invalidate()?;
        self.inner.shape.invalidate()?;
        self.inner.fields.borrow_mut().shift_remove(key);
        Ok(true)
    }

    /// Field names in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.shape.mark_usage();
        self.inner.fields.borrow().keys().cloned().collect()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.inner.shape.mark_usage();
        self.inner.fields.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current fields, recording a read of the shape and of every field.
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.inner.shape.mark_usage();
        let fields: Vec<(String, ObservableValue<Value>)> = self
            .inner
            .fields
            .borrow()
            .iter()
            .map(|(key, field)| (key.clone(), field.clone()))
            .collect();
        fields
            .into_iter()
            .map(|(key, field)| (key, field.get()))
            .collect()
    }

    /// Fields without recording any read.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.inner
            .fields
            .borrow()
            .iter()
            .map(|(key, field)| (key.clone(), field.get_untracked()))
            .collect()
    }

    /// A getter/setter bound to `key`.
    pub fn prop(&self, key: impl Into<String>) -> Prop<Value> {
        let this = self.clone();
        let key = key.into();
        Prop::new(move |value| {
            if let Some(value) = value {
                this.set(key.clone(), value)?;
            }
            Ok(this.get(&key))
        })
    }

    /// Number of readers depending on the object's shape.
    pub fn reader_count(&self) -> usize {
        self.inner.shape.reader_count()
    }
}

impl Default for ObservableObject {
    fn default() -> Self {
        Self::new()
    }
}

impl SameValue for ObservableObject {
    fn same_value(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }

    fn deep_equal(&self, other: &Self) -> bool {
        Value::Object(self.clone()).deep_equal(&Value::Object(other.clone()))
    }
}

impl Enhance for ObservableObject {
    fn observe(self, _children: Enhancer) -> std::result::Result<Self, Self> {
        Ok(self)
    }
}

impl fmt::Debug for ObservableObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableObject")
            .field("id", &self.inner.shape.id())
            .field("fields", &self.snapshot())
            .finish()
    }
}

impl Serialize for ObservableObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let fields = self.snapshot();
        let mut map = serializer.serialize_map(Some(fields.len()))?;
        for (key, value) in &fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}
