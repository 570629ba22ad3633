//! Observable Class Members
//!
//! Structs opt into observable members by embedding a [`Behind`] table and
//! implementing [`ObservableClass`]. Members are declared once, usually as
//! statics, against a [`ClassId`]:
//!
//! ```rust
//! use std::rc::Rc;
//! use rill_core::observable::{Behind, ClassId, ComputedMethod, Field, ObservableClass};
//!
//! static TASK: ClassId = ClassId::new("Todo");
//! static TITLE: Field<String> = Field::new(&TASK, "title");
//! static SHOUT: ComputedMethod<String> = ComputedMethod::new(&TASK, "shout");
//!
//! #[derive(Default)]
//! struct Todo {
//!     behind: Behind,
//! }
//!
//! impl ObservableClass for Todo {
//!     fn behind(&self) -> &Behind {
//!         &self.behind
//!     }
//! }
//!
//! let todo = Rc::new(Todo::default());
//! TITLE.set(&*todo, "ship it".to_string()).unwrap();
//! let shout = SHOUT.get(&todo, |todo| Ok(TITLE.get(&**todo).to_uppercase()));
//! assert_eq!(shout.unwrap(), "SHIP IT");
//! ```
//!
//! # How Members Are Stored
//!
//! Nothing is allocated until a member is first touched. The table then maps
//! `(class id, member name)` to the member's atom or derivation. Keying by
//! class id keeps a subclass member apart from the superclass member of the
//! same name, so an overriding computed can read the overridden one and both
//! stay separately memoized.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::error::{Error, Result};
use crate::graph::NodeId;
use crate::reactive::{Computed, ObservableValue, ParametricComputedMap, Prop};

use super::enhancer::{Enhance, Enhancer, SameValue};

/// Identity of a class of observable structs. The id is drawn on first use.
pub struct ClassId {
    name: &'static str,
    id: AtomicU64,
}

impl ClassId {
    /// Declare a class. The id is allocated on first use.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            id: AtomicU64::new(0),
        }
    }

    /// The class id, allocated on first call.
    pub fn id(&self) -> NodeId {
        let current = self.id.load(Ordering::Acquire);
        if current != 0 {
            return NodeId::from(current);
        }
        let fresh = NodeId::new().raw();
        match self
            .id
            .compare_exchange(0, fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => NodeId::from(fresh),
            Err(existing) => NodeId::from(existing),
        }
    }

    /// The class name given at declaration.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassId")
            .field("name", &self.name)
            .field("id", &self.id.load(Ordering::Relaxed))
            .finish()
    }
}

type MemberKey = (NodeId, &'static str);

/// Per-instance side table holding observable members.
#[derive(Default)]
pub struct Behind {
    members: RefCell<Option<HashMap<MemberKey, Rc<dyn Any>>>>,
}

impl Behind {
    /// An empty table. Nothing is allocated until a member is used.
    pub fn new() -> Self {
        Self::default()
    }

    fn find<S: Any + Clone>(&self, key: MemberKey) -> Option<S> {
        let members = self.members.borrow();
        let member = members.as_ref()?.get(&key)?;
        member.downcast_ref::<S>().cloned()
    }

    /// The member under `key`, created by `init` if missing.
    ///
    /// `init` runs without the table borrowed, so it may touch other members.
    fn member<S: Any + Clone>(&self, key: MemberKey, init: impl FnOnce() -> S) -> S {
        if let Some(member) = self.find::<S>(key) {
            return member;
        }
        let member = init();
        let previous = self
            .members
            .borrow_mut()
            .get_or_insert_with(HashMap::new)
            .insert(key, Rc::new(member.clone()));
        if previous.is_some() {
            warn!(member = key.1, "observable member replaced by one of another type");
        }
        member
    }

    /// Number of members allocated so far.
    pub fn len(&self) -> usize {
        self.members.borrow().as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any member was ever touched.
    pub fn is_allocated(&self) -> bool {
        self.members.borrow().is_some()
    }
}

impl fmt::Debug for Behind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Behind").field("members", &self.len()).finish()
    }
}

/// Structs carrying observable members.
pub trait ObservableClass {
    fn behind(&self) -> &Behind;
}

// ---- Fields ----

/// An observable field. Reads before the first write see `T::default()`.
pub struct Field<T> {
    class: &'static ClassId,
    name: &'static str,
    enhancer: Enhancer,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Field<T> {
    /// Declare a field stored with the deep enhancer.
    pub const fn new(class: &'static ClassId, name: &'static str) -> Self {
        Self::with_enhancer(class, name, Enhancer::Deep)
    }

    /// Declare a field stored with `enhancer`.
    pub const fn with_enhancer(class: &'static ClassId, name: &'static str, enhancer: Enhancer) -> Self {
        Self {
            class,
            name,
            enhancer,
            _marker: PhantomData,
        }
    }

    /// The member name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn key(&self) -> MemberKey {
        (self.class.id(), self.name)
    }
}

impl<T: Enhance + Default> Field<T> {
    fn cell(&self, owner: &impl ObservableClass) -> ObservableValue<T> {
        owner
            .behind()
            .member(self.key(), || ObservableValue::raw(T::default(), self.enhancer))
    }

    /// Read the field. A field never written reads as `T::default()`.
    pub fn get(&self, owner: &impl ObservableClass) -> T {
        self.cell(owner).get()
    }

    /// Write the field.
    pub fn set(&self, owner: &impl ObservableClass, value: T) -> Result<()> {
        let behind = owner.behind();
        match behind.find::<ObservableValue<T>>(self.key()) {
            Some(cell) => cell.set(value),
            None => {
                let cell = ObservableValue::with_enhancer(value, self.enhancer)?;
                behind.member(self.key(), || cell);
                Ok(())
            }
        }
    }

    /// A getter/setter bound to this field of `owner`.
    pub fn prop(&self, owner: &impl ObservableClass) -> Prop<T> {
        self.cell(owner).prop()
    }
}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("class", &self.class.name())
            .field("name", &self.name)
            .field("enhancer", &self.enhancer)
            .finish()
    }
}

// ---- Computed methods ----

/// A memoized, per-instance derivation.
///
/// The body is captured the first time an instance reads the method. It gets
/// the instance as an `Rc`, so it can call other members, including the
/// member of the same name on a superclass id.
pub struct ComputedMethod<T> {
    class: &'static ClassId,
    name: &'static str,
    structural: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ComputedMethod<T> {
    /// Results compare by same-value.
    pub const fn new(class: &'static ClassId, name: &'static str) -> Self {
        Self {
            class,
            name,
            structural: false,
            _marker: PhantomData,
        }
    }

    /// Results compare by deep equality.
    pub const fn structural(class: &'static ClassId, name: &'static str) -> Self {
        Self {
            class,
            name,
            structural: true,
            _marker: PhantomData,
        }
    }
}

impl<T: Clone + SameValue + 'static> ComputedMethod<T> {
    /// Evaluate the method for `owner`, memoized until its sources change.
    pub fn get<O, F>(&self, owner: &Rc<O>, body: F) -> Result<T>
    where
        O: ObservableClass + 'static,
        F: Fn(&Rc<O>) -> Result<T> + 'static,
    {
        let key = (self.class.id(), self.name);
        let structural = self.structural;
        let computed = owner.behind().member(key, || {
            let weak = Rc::downgrade(owner);
            let func = move || match weak.upgrade() {
                Some(owner) => body(&owner),
                None => Err(Error::OwnerDropped),
            };
            if structural {
                Computed::structural(func)
            } else {
                Computed::new(func)
            }
        });
        computed.get()
    }
}

impl<T> fmt::Debug for ComputedMethod<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedMethod")
            .field("class", &self.class.name())
            .field("name", &self.name)
            .field("structural", &self.structural)
            .finish()
    }
}

/// A per-instance [`ParametricComputedMap`].
pub struct ParametricMethod<P, T> {
    class: &'static ClassId,
    name: &'static str,
    _marker: PhantomData<fn(P) -> T>,
}

impl<P, T> ParametricMethod<P, T> {
    /// Declare a parametric method.
    pub const fn new(class: &'static ClassId, name: &'static str) -> Self {
        Self {
            class,
            name,
            _marker: PhantomData,
        }
    }
}

impl<P: Hash + Eq + 'static, T: Clone + SameValue + 'static> ParametricMethod<P, T> {
    /// Evaluate the method for `owner` and `params`, memoized per parameter.
    pub fn get<O, F>(&self, owner: &Rc<O>, params: P, body: F) -> Result<T>
    where
        O: ObservableClass + 'static,
        F: Fn(&Rc<O>, &P) -> Result<T> + 'static,
    {
        let key = (self.class.id(), self.name);
        let map = owner.behind().member(key, || {
            let weak = Rc::downgrade(owner);
            ParametricComputedMap::new(move |params: &P| match weak.upgrade() {
                Some(owner) => body(&owner, params),
                None => Err(Error::OwnerDropped),
            })
        });
        map.get(params)
    }

    /// Number of parameter values currently memoized for `owner`.
    pub fn len(&self, owner: &impl ObservableClass) -> usize {
        owner
            .behind()
            .find::<ParametricComputedMap<P, T>>((self.class.id(), self.name))
            .map_or(0, |map| map.len())
    }
}

impl<P, T> fmt::Debug for ParametricMethod<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParametricMethod")
            .field("class", &self.class.name())
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{reactive_scope, HostContext};
    use std::cell::Cell;

    static SHAPE: ClassId = ClassId::new("Shape");
    static SQUARE: ClassId = ClassId::new("Square");
    static SIDE: Field<f64> = Field::new(&SHAPE, "side");
    static SHAPE_AREA: ComputedMethod<f64> = ComputedMethod::new(&SHAPE, "area");
    static SQUARE_AREA: ComputedMethod<f64> = ComputedMethod::new(&SQUARE, "area");
    static SCALED: ParametricMethod<u32, f64> = ParametricMethod::new(&SQUARE, "scaled");

    #[derive(Default)]
    struct Square {
        behind: Behind,
        base_calls: Cell<u32>,
        own_calls: Cell<u32>,
    }

    impl ObservableClass for Square {
        fn behind(&self) -> &Behind {
            &self.behind
        }
    }

    fn shape_area(square: &Rc<Square>) -> Result<f64> {
        SHAPE_AREA.get(square, |s| {
            s.base_calls.set(s.base_calls.get() + 1);
            Ok(SIDE.get(&**s) * SIDE.get(&**s))
        })
    }

    fn square_area(square: &Rc<Square>) -> Result<f64> {
        SQUARE_AREA.get(square, |s| {
            s.own_calls.set(s.own_calls.get() + 1);
            Ok(shape_area(s)? + 1.0)
        })
    }

    #[test]
    fn class_ids_are_lazy_and_stable() {
        static LAZY: ClassId = ClassId::new("Lazy");
        let first = LAZY.id();
        assert_eq!(LAZY.id(), first);
        assert_ne!(SHAPE.id(), SQUARE.id());
        assert_eq!(LAZY.name(), "Lazy");
    }

    #[test]
    fn members_are_allocated_on_first_use() {
        let square = Square::default();
        assert!(!square.behind.is_allocated());
        assert_eq!(SIDE.get(&square), 0.0);
        assert!(square.behind.is_allocated());
        SIDE.set(&square, 2.0).unwrap();
        assert_eq!(square.behind.len(), 1);
        assert_eq!(SIDE.prop(&square).get().unwrap(), 2.0);
    }

    #[test]
    fn field_writes_notify_readers() {
        let square = Square::default();
        SIDE.set(&square, 1.0).unwrap();
        let ctx = HostContext::new();
        ctx.track(|| SIDE.get(&square));

        SIDE.set(&square, 1.0).unwrap();
        assert!(!ctx.is_invalidated());
        SIDE.set(&square, 3.0).unwrap();
        assert!(ctx.is_invalidated());
    }

    #[test]
    fn overriding_method_reads_superclass_method() {
        let square = Rc::new(Square::default());
        SIDE.set(&*square, 2.0).unwrap();
        let ctx = HostContext::new();

        assert_eq!(ctx.track(|| square_area(&square)).unwrap(), 5.0);
        assert_eq!(ctx.track(|| square_area(&square)).unwrap(), 5.0);
        assert_eq!(square.own_calls.get(), 1);
        assert_eq!(square.base_calls.get(), 1);

        SIDE.set(&*square, 3.0).unwrap();
        assert_eq!(ctx.track(|| square_area(&square)).unwrap(), 10.0);
        assert_eq!(square.own_calls.get(), 2);
        assert_eq!(square.base_calls.get(), 2);
        assert_eq!(square.behind.len(), 3);
    }

    #[test]
    fn parametric_method_memoizes_per_instance() {
        let square = Rc::new(Square::default());
        SIDE.set(&*square, 2.0).unwrap();
        let calls = Rc::new(Cell::new(0));

        let scaled = {
            let calls = calls.clone();
            move |square: &Rc<Square>, factor: u32| {
                let calls = calls.clone();
                SCALED.get(square, factor, move |s, factor| {
                    calls.set(calls.get() + 1);
                    Ok(SIDE.get(&**s) * f64::from(*factor))
                })
            }
        };

        let total = Rc::new(Cell::new(0.0));
        reactive_scope({
            let (square, total) = (square.clone(), total.clone());
            move || {
                total.set(scaled(&square, 2)? + scaled(&square, 2)? + scaled(&square, 3)?);
                assert_eq!(SCALED.len(&*square), 2);
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(total.get(), 14.0);
        assert_eq!(calls.get(), 2);
        assert_eq!(SCALED.len(&*square), 0);

        let other = Square::default();
        assert_eq!(SCALED.len(&other), 0);
    }
}
