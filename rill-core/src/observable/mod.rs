//! Observable Containers
//!
//! Containers give collection and record semantics on top of atoms:
//!
//! - [`ObservableArray`]: one structure atom for the whole vector.
//! - [`ObservableMap`] and [`ObservableObject`]: one structure atom for the
//!   key set, plus one observable value per key.
//! - Class members ([`Field`], [`ComputedMethod`], [`ParametricMethod`]):
//!   atoms and derivations allocated lazily in a per-instance [`Behind`]
//!   table.
//!
//! # How Values Are Stored
//!
//! Every write passes through an [`Enhancer`]. The deep enhancer turns plain
//! [`Value`] structure into observable containers all the way down; the
//! shallow one wraps a single level. Typed containers (`ObservableArray<i32>`
//! and so on) store their items as they are.
//!
//! Structural comparison ([`deep_equal`]) looks through containers, so an
//! observable structure and a plain structure holding the same data compare
//! equal.

mod array;
mod class;
mod enhancer;
mod map;
mod object;
mod value;

pub use array::ObservableArray;
pub use class::{Behind, ClassId, ComputedMethod, Field, ObservableClass, ParametricMethod};
pub use enhancer::{deep_equal, Enhance, Enhancer, SameValue};
pub use map::ObservableMap;
pub use object::ObservableObject;
pub use value::Value;
