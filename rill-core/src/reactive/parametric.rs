//! Parametric Computeds
//!
//! A parametric computed memoizes one derivation per distinct parameter
//! value. Entries are looked up by hash, then by equality within a bucket.
//!
//! Each entry is an ordinary derivation: it is buried when nothing reads it,
//! and at that point it is removed from the map for good and `on_free` is
//! called with its last value.

use std::cell::{Cell, RefCell};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::time::Duration;

use smallvec::SmallVec;

use crate::error::Result;
use crate::graph::NodeId;
use crate::observable::SameValue;

use super::async_computed::{boxed_factory, AsyncComputedImpl, AsyncContext, AsyncResult};
use super::computed::{Comparator, ComputedImpl, ComputedOptions, FreeAction};
use super::derivation::Derivation;

type ParamsHash<P> = Rc<dyn Fn(&P) -> u64>;
type ParamsEq<P> = Rc<dyn Fn(&P, &P) -> bool>;
type OnFree<P, T> = Rc<dyn Fn(Option<&T>, &P)>;

fn default_hash<P: Hash>(params: &P) -> u64 {
    let mut hasher = DefaultHasher::new();
    params.hash(&mut hasher);
    hasher.finish()
}

struct Entry<P, D> {
    params: Rc<P>,
    derivation: Rc<D>,
}

/// Hash buckets of derivations keyed by parameters.
struct Buckets<P, D> {
    rows: RefCell<HashMap<u64, SmallVec<[Entry<P, D>; 1]>>>,
    disposing: Cell<bool>,
}

impl<P, D: Derivation> Buckets<P, D> {
    fn new() -> Self {
        Self {
            rows: RefCell::new(HashMap::new()),
            disposing: Cell::new(false),
        }
    }

    fn find(&self, hash: u64, params: &P, is_equal: &dyn Fn(&P, &P) -> bool) -> Option<Rc<D>> {
        let rows = self.rows.borrow();
        rows.get(&hash)?
            .iter()
            .find(|entry| is_equal(params, &entry.params))
            .map(|entry| entry.derivation.clone())
    }

    fn insert(&self, hash: u64, params: Rc<P>, derivation: Rc<D>) {
        self.rows
            .borrow_mut()
            .entry(hash)
            .or_default()
            .push(Entry { params, derivation });
    }

    fn remove(&self, hash: u64, id: NodeId) {
        if self.disposing.get() {
            return;
        }
        let mut rows = self.rows.borrow_mut();
        if let Some(row) = rows.get_mut(&hash) {
            row.retain(|entry| entry.derivation.id() != id);
            if row.is_empty() {
                rows.remove(&hash);
            }
        }
    }

    fn len(&self) -> usize {
        self.rows.borrow().values().map(|row| row.len()).sum()
    }

    fn dispose_all(&self) {
        self.disposing.set(true);
        let all: Vec<Rc<D>> = self
            .rows
            .borrow()
            .values()
            .flat_map(|row| row.iter().map(|entry| entry.derivation.clone()))
            .collect();
        for derivation in all {
            derivation.dispose();
        }
        self.rows.borrow_mut().clear();
        self.disposing.set(false);
    }
}

/// Key handling shared by the sync and async maps.
struct Keying<P, T> {
    hash: ParamsHash<P>,
    is_equal: ParamsEq<P>,
    on_free: Option<OnFree<P, T>>,
    comparator: Comparator<T>,
    zombie_time: Option<Duration>,
}

impl<P: Hash + Eq + 'static, T: SameValue + 'static> Keying<P, T> {
    fn from_options(options: ComputedOptions<P, T>) -> Self {
        let comparator = options.comparator_or_default();
        Self {
            hash: options.hash.unwrap_or_else(|| Rc::new(default_hash::<P>)),
            is_equal: options.is_equal.unwrap_or_else(|| Rc::new(|a: &P, b: &P| a == b)),
            on_free: options.on_free,
            comparator,
            zombie_time: options.zombie_time,
        }
    }
}

struct ParamMapInner<P, T> {
    func: Rc<dyn Fn(&P) -> Result<T>>,
    keying: Keying<P, T>,
    entries: Buckets<P, ComputedImpl<T>>,
}

/// One memoized computed per distinct parameter value.
///
/// # Example
///
/// ```rust
/// use rill_core::reactive::{ObservableValue, ParametricComputedMap};
///
/// let base = ObservableValue::new(10);
/// let plus = ParametricComputedMap::new({
///     let base = base.clone();
///     move |n: &i32| Ok(base.get() + n)
/// });
///
/// assert_eq!(plus.get(1).unwrap(), 11);
/// assert_eq!(plus.get(2).unwrap(), 12);
/// assert_eq!(plus.len(), 2);
/// ```
pub struct ParametricComputedMap<P, T> {
    inner: Rc<ParamMapInner<P, T>>,
}

impl<P, T> Clone for ParametricComputedMap<P, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Hash + Eq + 'static, T: Clone + SameValue + 'static> ParametricComputedMap<P, T> {
    /// A map evaluating `f` once per distinct parameter.
    pub fn new(f: impl Fn(&P) -> Result<T> + 'static) -> Self {
        Self::with_options(f, ComputedOptions::default())
    }

    /// Like [`new`](Self::new), with custom hashing, equality and free callback.
    pub fn with_options(f: impl Fn(&P) -> Result<T> + 'static, options: ComputedOptions<P, T>) -> Self {
        Self {
            inner: Rc::new(ParamMapInner {
                func: Rc::new(f),
                keying: Keying::from_options(options),
                entries: Buckets::new(),
            }),
        }
    }
}

impl<P: 'static, T: Clone + 'static> ParametricComputedMap<P, T> {
    /// Read the computed for `params`, creating it on first use.
    pub fn get(&self, params: P) -> Result<T> {
        let hash = (self.inner.keying.hash)(&params);
        let existing = self
            .inner
            .entries
            .find(hash, &params, self.inner.keying.is_equal.as_ref());
        let computed = match existing {
            Some(computed) => computed,
            None => self.create(hash, params),
        };
        computed.run()
    }

    fn create(&self, hash: u64, params: P) -> Rc<ComputedImpl<T>> {
        let params = Rc::new(params);
        let func = self.inner.func.clone();
        let call_params = params.clone();
        let owner = Rc::downgrade(&self.inner);
        let on_free = self.inner.keying.on_free.clone();
        let free_params = params.clone();
        let computed = ComputedImpl::new(
            Box::new(move || func(&call_params)),
            self.inner.keying.comparator.clone(),
            self.inner.keying.zombie_time,
            FreeAction::Detach(Box::new(move |id, value| {
                if let Some(on_free) = &on_free {
                    on_free(value, &free_params);
                }
                if let Some(owner) = owner.upgrade() {
                    owner.entries.remove(hash, id);
                }
            })),
        );
        self.inner.entries.insert(hash, params, computed.clone());
        computed
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispose every entry. `on_free` runs for each of them.
    pub fn dispose(&self) {
        self.inner.entries.dispose_all();
    }
}

impl<P, T> fmt::Debug for ParametricComputedMap<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParametricComputedMap")
            .field("entries", &self.inner.entries.rows.borrow().len())
            .finish()
    }
}

type ParamFactory<P, T> = Rc<dyn Fn(&P, AsyncContext<T>) -> super::async_computed::Task<T>>;

struct ParamAsyncMapInner<P, T> {
    factory: ParamFactory<P, T>,
    keying: Keying<P, T>,
    entries: Buckets<P, AsyncComputedImpl<T>>,
}

/// One async computed per distinct parameter value.
pub struct ParametricAsyncComputedMap<P, T> {
    inner: Rc<ParamAsyncMapInner<P, T>>,
}

impl<P, T> Clone for ParametricAsyncComputedMap<P, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Hash + Eq + 'static, T: Clone + SameValue + 'static> ParametricAsyncComputedMap<P, T> {
    /// A map starting one async run per distinct parameter.
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn(&P, AsyncContext<T>) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        Self::with_options(factory, ComputedOptions::default())
    }

    /// Like [`new`](Self::new), with custom hashing, equality and free callback.
    pub fn with_options<F, Fut>(factory: F, options: ComputedOptions<P, T>) -> Self
    where
        F: Fn(&P, AsyncContext<T>) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        use futures_util::FutureExt;

        Self {
            inner: Rc::new(ParamAsyncMapInner {
                factory: Rc::new(move |params: &P, cx| factory(params, cx).boxed_local()),
                keying: Keying::from_options(options),
                entries: Buckets::new(),
            }),
        }
    }
}

impl<P: 'static, T: Clone + 'static> ParametricAsyncComputedMap<P, T> {
    /// Start or join the run for `params`.
    pub fn get(&self, params: P) -> Result<AsyncResult<T>> {
        let hash = (self.inner.keying.hash)(&params);
        let existing = self
            .inner
            .entries
            .find(hash, &params, self.inner.keying.is_equal.as_ref());
        let computed = match existing {
            Some(computed) => computed,
            None => self.create(hash, params),
        };
        computed.run()
    }

    fn create(&self, hash: u64, params: P) -> Rc<AsyncComputedImpl<T>> {
        let params = Rc::new(params);
        let factory = self.inner.factory.clone();
        let call_params = params.clone();
        let owner = Rc::downgrade(&self.inner);
        let on_free = self.inner.keying.on_free.clone();
        let free_params = params.clone();
        let computed = AsyncComputedImpl::new(
            boxed_factory(move |cx| factory(&call_params, cx)),
            self.inner.keying.comparator.clone(),
            self.inner.keying.zombie_time,
            FreeAction::Detach(Box::new(move |id, value| {
                if let Some(on_free) = &on_free {
                    on_free(value, &free_params);
                }
                if let Some(owner) = owner.upgrade() {
                    owner.entries.remove(hash, id);
                }
            })),
        );
        self.inner.entries.insert(hash, params, computed.clone());
        computed
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispose every entry.
    pub fn dispose(&self) {
        self.inner.entries.dispose_all();
    }
}

impl<P, T> fmt::Debug for ParametricAsyncComputedMap<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParametricAsyncComputedMap")
            .field("entries", &self.inner.entries.rows.borrow().len())
            .finish()
    }
}

/// A memoized function from source values to derived values.
///
/// Each source gets its own computed, freed once nothing reads it.
pub struct Transformer<A, B> {
    map: ParametricComputedMap<A, B>,
}

impl<A, B> Clone for Transformer<A, B> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
        }
    }
}

impl<A: 'static, B: Clone + 'static> Transformer<A, B> {
    /// The derived value for `source`, computed once while it is being read.
    pub fn transform(&self, source: A) -> Result<B> {
        self.map.get(source)
    }

    /// Number of sources with a live derived value.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Dispose every memoized derivation.
    pub fn dispose(&self) {
        self.map.dispose();
    }
}

impl<A, B> fmt::Debug for Transformer<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformer").field("map", &self.map).finish()
    }
}

/// Build a [`Transformer`] that memoizes `factory` per source value.
pub fn create_transformer<A, B>(factory: impl Fn(&A) -> Result<B> + 'static) -> Transformer<A, B>
where
    A: Hash + Eq + 'static,
    B: Clone + SameValue + 'static,
{
    Transformer {
        map: ParametricComputedMap::new(factory),
    }
}

/// Like [`create_transformer`], calling `on_free` with the last derived
/// value and its source when an entry is freed.
pub fn create_transformer_with_free<A, B>(
    factory: impl Fn(&A) -> Result<B> + 'static,
    on_free: impl Fn(Option<&B>, &A) + 'static,
) -> Transformer<A, B>
where
    A: Hash + Eq + 'static,
    B: Clone + SameValue + 'static,
{
    Transformer {
        map: ParametricComputedMap::with_options(factory, ComputedOptions::new().on_free(on_free)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{reactive_scope, ObservableValue, Runtime};

    fn counting_map(
        v: &ObservableValue<i32>,
        calls: &Rc<Cell<usize>>,
        options: ComputedOptions<i32, i32>,
    ) -> ParametricComputedMap<i32, i32> {
        let (v, calls) = (v.clone(), calls.clone());
        ParametricComputedMap::with_options(
            move |p: &i32| {
                calls.set(calls.get() + 1);
                Ok(p + v.get())
            },
            options,
        )
    }

    #[test]
    fn memoizes_per_parameter_in_scope() {
        let v = ObservableValue::new(1);
        let calls = Rc::new(Cell::new(0));
        let f1 = counting_map(&v, &calls, ComputedOptions::new());

        reactive_scope({
            let (f1, v, calls) = (f1.clone(), v.clone(), calls.clone());
            move || {
                assert_eq!(f1.get(1)?, 2);
                assert_eq!(calls.get(), 1);
                assert_eq!(f1.get(2)?, 3);
                assert_eq!(calls.get(), 2);
                assert_eq!(f1.get(2)?, 3);
                assert_eq!(calls.get(), 2);
                v.set(2)?;
                assert_eq!(f1.get(2)?, 4);
                assert_eq!(calls.get(), 3);
                assert_eq!(f1.get(2)?, 4);
                assert_eq!(calls.get(), 3);
                Ok(())
            }
        })
        .unwrap();
        assert!(f1.is_empty());
    }

    #[test]
    fn outside_reads_live_until_next_frame() {
        let v = ObservableValue::new(1);
        let calls = Rc::new(Cell::new(0));
        let f1 = counting_map(&v, &calls, ComputedOptions::new());

        assert_eq!(f1.get(1).unwrap(), 2);
        assert_eq!(f1.get(1).unwrap(), 2);
        assert_eq!(calls.get(), 1);

        Runtime::before_frame().unwrap();
        assert!(f1.is_empty());
        assert_eq!(f1.get(1).unwrap(), 2);
        assert_eq!(calls.get(), 2);

        v.set(2).unwrap();
        assert_eq!(f1.get(1).unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn customized_hash_and_free() {
        let v = ObservableValue::new(1);
        let calls = Rc::new(Cell::new(0));
        let frees = Rc::new(Cell::new(0));
        let options = ComputedOptions::new().hash(|_: &i32| 0).on_free({
            let frees = frees.clone();
            move |_: Option<&i32>, _: &i32| frees.set(frees.get() + 1)
        });
        let f2 = counting_map(&v, &calls, options);

        reactive_scope({
            let (f2, v, calls, frees) = (f2.clone(), v.clone(), calls.clone(), frees.clone());
            move || {
                assert_eq!(f2.get(1)?, 2);
                assert_eq!(f2.get(2)?, 3);
                assert_eq!(f2.get(2)?, 3);
                assert_eq!(calls.get(), 2);
                v.set(2)?;
                assert_eq!(f2.get(2)?, 4);
                assert_eq!(calls.get(), 3);
                assert_eq!(frees.get(), 0);
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(frees.get(), 2);
        assert!(f2.is_empty());
    }

    #[test]
    fn dispose_frees_every_entry() {
        let freed = Rc::new(RefCell::new(Vec::new()));
        let map = ParametricComputedMap::with_options(
            |p: &String| Ok(p.len()),
            ComputedOptions::new().on_free({
                let freed = freed.clone();
                move |value: Option<&usize>, params: &String| {
                    freed.borrow_mut().push((params.clone(), value.copied()))
                }
            }),
        );
        map.get("ab".to_string()).unwrap();
        map.get("abc".to_string()).unwrap();

        map.dispose();
        let mut freed = freed.borrow().clone();
        freed.sort();
        assert_eq!(
            freed,
            vec![("ab".to_string(), Some(2)), ("abc".to_string(), Some(3))]
        );
        assert!(map.is_empty());
    }

    #[test]
    fn transformer_frees_with_source() {
        let freed = Rc::new(Cell::new(0));
        let upper = create_transformer_with_free(
            |s: &String| Ok(s.to_uppercase()),
            {
                let freed = freed.clone();
                move |value: Option<&String>, source: &String| {
                    assert_eq!(value.map(String::as_str), Some("HI"));
                    assert_eq!(source, "hi");
                    freed.set(freed.get() + 1);
                }
            },
        );

        reactive_scope({
            let upper = upper.clone();
            move || {
                assert_eq!(upper.transform("hi".to_string())?, "HI");
                assert_eq!(upper.len(), 1);
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(freed.get(), 1);
        assert!(upper.is_empty());
    }
}
