//! Dynamic Values
//!
//! [`Value`] is the dynamically typed payload for deep observation. Plain
//! structure (`List`, `Record`, `Dict`) becomes observable structure
//! (`Array`, `Object`, `Map`) when it is written through a deep or shallow
//! enhancer.
//!
//! Equality follows identity for structure and value equality for
//! primitives, with `NaN` equal to itself and `0.0` equal to `-0.0`. `Hash`
//! agrees with that, so values can key an [`ObservableMap`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use super::array::ObservableArray;
use super::enhancer::{Enhance, Enhancer, SameValue};
use super::map::ObservableMap;
use super::object::ObservableObject;

/// Largest integer a double holds exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    /// Plain sequence.
    List(Rc<Vec<Value>>),
    /// Plain record with string keys.
    Record(Rc<IndexMap<String, Value>>),
    /// Plain dictionary with arbitrary keys.
    Dict(Rc<IndexMap<Value, Value>>),
    Array(ObservableArray<Value>),
    Object(ObservableObject),
    Map(ObservableMap<Value, Value>),
}

impl Value {
    /// A plain list.
    pub fn list(items: impl IntoIterator<Item = Value>) -> Value {
        Value::List(Rc::new(items.into_iter().collect()))
    }

    /// A plain record with ordered string keys.
    pub fn record<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Value {
        Value::Record(Rc::new(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        ))
    }

    /// A plain dictionary with ordered value keys.
    pub fn dict(entries: impl IntoIterator<Item = (Value, Value)>) -> Value {
        Value::Dict(Rc::new(entries.into_iter().collect()))
    }

    /// Make plain structure deeply observable. Anything else is returned
    /// unchanged.
    pub fn wrap(self) -> Value {
        Enhancer::Deep.store(self)
    }

    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Record(_) => "record",
            Value::Dict(_) => "dict",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Map(_) => "map",
        }
    }

    /// Whether this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The number, if this is one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The string, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ObservableArray<Value>> {
        match self {
            Value::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObservableObject> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ObservableMap<Value, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Items of a sequence, plain or observable, without recording reads.
    pub fn items_untracked(&self) -> Option<Vec<Value>> {
        match self {
            Value::List(items) => Some(items.as_ref().clone()),
            Value::Array(array) => Some(array.snapshot()),
            _ => None,
        }
    }

    /// Entries of a keyed value, plain or observable, without recording
    /// reads. Record and object keys become strings.
    pub fn entries_untracked(&self) -> Option<Vec<(Value, Value)>> {
        match self {
            Value::Record(record) => Some(
                record
                    .iter()
                    .map(|(key, value)| (Value::from(key.as_str()), value.clone()))
                    .collect(),
            ),
            Value::Dict(dict) => Some(
                dict.iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            ),
            Value::Object(object) => Some(
                object
                    .snapshot()
                    .into_iter()
                    .map(|(key, value)| (Value::from(key), value))
                    .collect(),
            ),
            Value::Map(map) => Some(map.snapshot()),
            _ => None,
        }
    }

    /// Copy into plain structure, recursively, without recording reads.
    pub fn to_plain(&self) -> Value {
        if let Some(items) = self.items_untracked() {
            return Value::list(items.iter().map(Value::to_plain));
        }
        match self {
            Value::Record(_) | Value::Object(_) => Value::record(
                self.entries_untracked()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(key, value)| (key.key_string(), value.to_plain())),
            ),
            Value::Dict(_) | Value::Map(_) => Value::dict(
                self.entries_untracked()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(key, value)| (key, value.to_plain())),
            ),
            other => other.clone(),
        }
    }

    /// The JSON rendering of the current contents.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// The string a key turns into when it keys a JSON object.
    pub fn key_string(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.to_string(),
            other => other.kind().to_string(),
        }
    }

    fn is_sequence(&self) -> bool {
        matches!(self, Value::List(_) | Value::Array(_))
    }

    fn is_keyed(&self) -> bool {
        matches!(
            self,
            Value::Record(_) | Value::Dict(_) | Value::Object(_) | Value::Map(_)
        )
    }
}

fn integral(n: f64) -> Option<i64> {
    (n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER).then_some(n as i64)
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    match integral(n) {
        Some(i) => i.to_string(),
        None => n.to_string(),
    }
}

fn rc_addr<T: ?Sized>(rc: &Rc<T>) -> usize {
    Rc::as_ptr(rc) as *const () as usize
}

impl SameValue for Value {
    fn same_value(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a.same_value(b),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Record(a), Value::Record(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Map(a), Value::Map(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Observable and plain structure compare alike: sequences by length
    /// and items, keyed values by key set and values.
    fn deep_equal(&self, other: &Self) -> bool {
        if self.same_value(other) {
            return true;
        }
        if self.is_sequence() || other.is_sequence() {
            return match (self.items_untracked(), other.items_untracked()) {
                (Some(a), Some(b)) => {
                    a.len() == b.len() && a.iter().zip(&b).all(|(a, b)| a.deep_equal(b))
                }
                _ => false,
            };
        }
        if self.is_keyed() && other.is_keyed() {
            let (Some(ours), Some(theirs)) = (self.entries_untracked(), other.entries_untracked())
            else {
                return false;
            };
            if ours.len() != theirs.len() {
                return false;
            }
            let theirs: IndexMap<Value, Value> = theirs.into_iter().collect();
            return ours.iter().all(|(key, value)| {
                theirs
                    .get(key)
                    .is_some_and(|other| value.deep_equal(other))
            });
        }
        false
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.same_value(other)
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Number(n) => {
                let bits = if n.is_nan() {
                    f64::NAN.to_bits()
                } else if *n == 0.0 {
                    0
                } else {
                    n.to_bits()
                };
                bits.hash(state);
            }
            Value::String(s) => s.hash(state),
            Value::List(items) => rc_addr(items).hash(state),
            Value::Record(record) => rc_addr(record).hash(state),
            Value::Dict(dict) => rc_addr(dict).hash(state),
            Value::Array(array) => array.addr().hash(state),
            Value::Object(object) => object.addr().hash(state),
            Value::Map(map) => map.addr().hash(state),
        }
    }
}

impl Enhance for Value {
    fn observe(self, children: Enhancer) -> std::result::Result<Self, Self> {
        match self {
            Value::List(items) => Ok(Value::Array(ObservableArray::observed(
                items.as_ref().clone(),
                children,
            ))),
            Value::Record(record) => Ok(Value::Object(ObservableObject::observed(
                record.as_ref().clone(),
                children,
            ))),
            Value::Dict(dict) => Ok(Value::Map(ObservableMap::observed(
                dict.as_ref().clone(),
                children,
            ))),
            Value::Array(_) | Value::Object(_) | Value::Map(_) => Ok(self),
            primitive => Err(primitive),
        }
    }

    fn is_nullish(&self) -> bool {
        self.is_null()
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => match integral(*n) {
                Some(i) => serializer.serialize_i64(i),
                None => serializer.serialize_f64(*n),
            },
            Value::String(s) => serializer.serialize_str(s),
            Value::List(_) | Value::Array(_) => {
                let items = self.items_untracked().unwrap_or_default();
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in &items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Record(_) | Value::Object(_) | Value::Dict(_) | Value::Map(_) => {
                let entries = self.entries_untracked().unwrap_or_default();
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in &entries {
                    map.serialize_entry(&key.key_string(), value)?;
                }
                map.end()
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Number(n) => f.write_str(&format_number(*n)),
            Value::Null | Value::Bool(_) => f.write_str(&self.key_string()),
            other => f.write_str(&other.to_json().to_string()),
        }
    }
}

// ---- Conversions ----

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! from_number {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(n: $ty) -> Self {
                    Value::Number(n as f64)
                }
            }
        )*
    };
}

from_number!(f32, f64, i8, i16, i32, i64, u8, u16, u32, u64, isize, usize);

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

impl From<Rc<str>> for Value {
    fn from(s: Rc<str>) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(Rc::new(items))
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(record: IndexMap<String, Value>) -> Self {
        Value::Record(Rc::new(record))
    }
}

impl From<ObservableArray<Value>> for Value {
    fn from(array: ObservableArray<Value>) -> Self {
        Value::Array(array)
    }
}

impl From<ObservableObject> for Value {
    fn from(object: ObservableObject) -> Self {
        Value::Object(object)
    }
}

impl From<ObservableMap<Value, Value>> for Value {
    fn from(map: ObservableMap<Value, Value>) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    /// Convert to plain structure.
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::from(s),
            serde_json::Value::Array(items) => Value::list(items.into_iter().map(Value::from)),
            serde_json::Value::Object(fields) => {
                Value::record(fields.into_iter().map(|(key, value)| (key, Value::from(value))))
            }
        }
    }
}
