//! Enhancers
//!
//! An enhancer decides how a value is stored when it is written into an
//! observable slot:
//!
//! | Enhancer     | Plain structure becomes              | Unchanged when      |
//! |--------------|--------------------------------------|---------------------|
//! | `Deep`       | observable, children `Deep`          | same value          |
//! | `Shallow`    | observable, children stored as given | same value          |
//! | `Ref`        | stored as given                      | never (caller)      |
//! | `DeepStruct` | observable, children `DeepStruct`    | structurally equal  |
//! | `RefStruct`  | stored as given                      | structurally equal  |
//!
//! "Unchanged" means the old stored value is kept, so the write does not
//! notify anybody.

use std::rc::Rc;

use crate::error::{Error, Result};

/// Equality used for change detection.
pub trait SameValue {
    /// Identity for structured values, value equality for primitives.
    /// `NaN` is the same as `NaN`.
    fn same_value(&self, other: &Self) -> bool;

    /// Structural equality: sequences element by element, keyed collections
    /// key by key. Defaults to [`same_value`](SameValue::same_value).
    fn deep_equal(&self, other: &Self) -> bool {
        self.same_value(other)
    }
}

/// Values that can be stored in observable slots.
pub trait Enhance: SameValue + Clone + 'static {
    /// Turn plain structure into observable structure whose children are
    /// stored with `children`. Values with no structure come back in `Err`.
    fn observe(self, _children: Enhancer) -> std::result::Result<Self, Self> {
        Err(self)
    }

    /// Whether this is an absent value (`null` / `None`).
    fn is_nullish(&self) -> bool {
        false
    }
}

/// Structural equality of two values.
pub fn deep_equal<T: SameValue + ?Sized>(a: &T, b: &T) -> bool {
    a.deep_equal(b)
}

/// Storage strategy applied on every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Enhancer {
    #[default]
    Deep,
    Shallow,
    Ref,
    DeepStruct,
    RefStruct,
}

impl Enhancer {
    /// The enhancer used for children of structure stored with `self`.
    pub fn children(self) -> Enhancer {
        match self {
            Enhancer::Deep => Enhancer::Deep,
            Enhancer::DeepStruct => Enhancer::DeepStruct,
            Enhancer::Shallow | Enhancer::Ref => Enhancer::Ref,
            Enhancer::RefStruct => Enhancer::RefStruct,
        }
    }

    /// Compute the value to store when `value` is written over `old`.
    ///
    /// Returns `old` itself (cloned) when the write should count as no
    /// change.
    pub fn apply<T: Enhance>(self, value: T, old: Option<&T>) -> Result<T> {
        match self {
            Enhancer::Ref => Ok(value),
            Enhancer::RefStruct => match old {
                Some(old) if old.deep_equal(&value) => Ok(old.clone()),
                _ => Ok(value),
            },
            Enhancer::Deep => match old {
                Some(old) if old.same_value(&value) => Ok(old.clone()),
                _ => Ok(self.store(value)),
            },
            Enhancer::DeepStruct => match old {
                Some(old) if old.deep_equal(&value) => Ok(old.clone()),
                _ => Ok(self.store(value)),
            },
            Enhancer::Shallow => {
                if let Some(old) = old {
                    if old.same_value(&value) {
                        return Ok(old.clone());
                    }
                }
                match value.observe(Enhancer::Ref) {
                    Ok(observed) => Ok(observed),
                    Err(plain) if plain.is_nullish() => Ok(plain),
                    Err(_) => Err(Error::ShallowPrimitive),
                }
            }
        }
    }

    /// Store a value written into a fresh slot. Primitives are kept as they
    /// are, whatever the enhancer.
    pub(crate) fn store<T: Enhance>(self, value: T) -> T {
        match self {
            Enhancer::Ref | Enhancer::RefStruct => value,
            Enhancer::Deep | Enhancer::DeepStruct | Enhancer::Shallow => value
                .observe(self.children())
                .unwrap_or_else(|plain| plain),
        }
    }
}

// ---- Primitive impls ----

macro_rules! same_value_by_eq {
    ($($ty:ty),* $(,)?) => {
        $(
            impl SameValue for $ty {
                fn same_value(&self, other: &Self) -> bool {
                    self == other
                }
            }

            impl Enhance for $ty {}
        )*
    };
}

same_value_by_eq!(
    bool, char, (), i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, String,
    &'static str, Rc<str>,
);

macro_rules! same_value_float {
    ($($ty:ty),*) => {
        $(
            impl SameValue for $ty {
                fn same_value(&self, other: &Self) -> bool {
                    self == other || (self.is_nan() && other.is_nan())
                }
            }

            impl Enhance for $ty {}
        )*
    };
}

same_value_float!(f32, f64);

impl<T: SameValue> SameValue for Option<T> {
    fn same_value(&self, other: &Self) -> bool {
        match (self, other) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same_value(b),
            _ => false,
        }
    }

    fn deep_equal(&self, other: &Self) -> bool {
        match (self, other) {
            (None, None) => true,
            (Some(a), Some(b)) => a.deep_equal(b),
            _ => false,
        }
    }
}

impl<T: Enhance> Enhance for Option<T> {
    fn observe(self, children: Enhancer) -> std::result::Result<Self, Self> {
        match self {
            Some(value) => value.observe(children).map(Some).map_err(Some),
            None => Err(None),
        }
    }

    fn is_nullish(&self) -> bool {
        self.is_none()
    }
}

impl<T: SameValue> SameValue for Vec<T> {
    fn same_value(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other).all(|(a, b)| a.same_value(b))
    }

    fn deep_equal(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other).all(|(a, b)| a.deep_equal(b))
    }
}

impl<T: Enhance> Enhance for Vec<T> {
    fn observe(self, children: Enhancer) -> std::result::Result<Self, Self> {
        Ok(self.into_iter().map(|item| children.store(item)).collect())
    }
}
