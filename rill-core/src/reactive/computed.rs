//! Computed Values
//!
//! A computed is a derived value that caches its result. It re-evaluates only
//! when it is read after one of its sources changed.
//!
//! # How Computeds Work
//!
//! 1. On read, the computed brings itself up to date (see
//!    [`Derivation::update_if_needed`]) and records the read.
//! 2. Evaluation runs with the computed as the current reader, so every
//!    source it touches is recorded as a dependency.
//! 3. The result (value or error) is compared with the previous one. Only a
//!    real change invalidates the computed's own readers.
//! 4. A computed read outside of any reader is remembered and buried at the
//!    start of the next frame, unless something starts reading it first.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::graph::{scheduler, NodeId, Reader};
use crate::observable::SameValue;

use super::context::ReactiveContext;
use super::derivation::{ComputedState, Derivation, DerivationCore};
use super::interrupt;

/// Decides whether two results are the same.
pub type Comparator<T> = Rc<dyn Fn(&T, &T) -> bool>;

/// What happens to a computed's value when it is freed.
pub(crate) enum FreeAction<T> {
    Keep,
    /// Report the value; the computed can be evaluated again later.
    Notify(Box<dyn Fn(Option<&T>)>),
    /// Report the value and retire the computed for good.
    Detach(Box<dyn Fn(NodeId, Option<&T>)>),
}

/// Options for computeds, parametric maps and transformers.
///
/// `P` is the parameter type; plain computeds use `()`.
pub struct ComputedOptions<P, T> {
    pub(crate) hash: Option<Rc<dyn Fn(&P) -> u64>>,
    pub(crate) is_equal: Option<Rc<dyn Fn(&P, &P) -> bool>>,
    pub(crate) on_free: Option<Rc<dyn Fn(Option<&T>, &P)>>,
    pub(crate) comparator: Option<Comparator<T>>,
    pub(crate) zombie_time: Option<Duration>,
}

impl<P, T> Default for ComputedOptions<P, T> {
    fn default() -> Self {
        Self {
            hash: None,
            is_equal: None,
            on_free: None,
            comparator: None,
            zombie_time: None,
        }
    }
}

impl<P, T> ComputedOptions<P, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash used to bucket parameters.
    pub fn hash(mut self, hash: impl Fn(&P) -> u64 + 'static) -> Self {
        self.hash = Some(Rc::new(hash));
        self
    }

    /// Equality used to find parameters inside a bucket.
    pub fn equality(mut self, is_equal: impl Fn(&P, &P) -> bool + 'static) -> Self {
        self.is_equal = Some(Rc::new(is_equal));
        self
    }

    /// Called with the last value when the computed is freed.
    pub fn on_free(mut self, on_free: impl Fn(Option<&T>, &P) + 'static) -> Self {
        self.on_free = Some(Rc::new(on_free));
        self
    }

    /// Decides whether a new result counts as a change.
    pub fn comparator(mut self, comparator: impl Fn(&T, &T) -> bool + 'static) -> Self {
        self.comparator = Some(Rc::new(comparator));
        self
    }

    /// Keep the computed alive this long after its last reader goes away.
    pub fn zombie_time(mut self, zombie_time: Duration) -> Self {
        self.zombie_time = Some(zombie_time);
        self
    }
}

impl<P, T: SameValue + 'static> ComputedOptions<P, T> {
    /// Compare results with [`SameValue::deep_equal`].
    pub fn structural(self) -> Self {
        self.comparator(|a: &T, b: &T| a.deep_equal(b))
    }

    pub(crate) fn comparator_or_default(&self) -> Comparator<T> {
        self.comparator
            .clone()
            .unwrap_or_else(|| Rc::new(|a: &T, b: &T| a.same_value(b)))
    }
}

impl<P, T> fmt::Debug for ComputedOptions<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedOptions")
            .field("hash", &self.hash.is_some())
            .field("equality", &self.is_equal.is_some())
            .field("on_free", &self.on_free.is_some())
            .field("comparator", &self.comparator.is_some())
            .field("zombie_time", &self.zombie_time)
            .finish()
    }
}

pub(crate) fn same_outcome<T>(comparator: &Comparator<T>, a: &Result<T>, b: &Result<T>) -> bool {
    match (a, b) {
        (Ok(a), Ok(b)) => comparator(a, b),
        (Err(a), Err(b)) => a == b,
        _ => false,
    }
}

pub(crate) struct ComputedImpl<T> {
    core: DerivationCore,
    me: Weak<ComputedImpl<T>>,
    func: Box<dyn Fn() -> Result<T>>,
    value: RefCell<Option<Result<T>>>,
    comparator: Comparator<T>,
    free_action: FreeAction<T>,
    scope: bool,
}

impl<T: Clone + 'static> ComputedImpl<T> {
    pub(crate) fn new(
        func: Box<dyn Fn() -> Result<T>>,
        comparator: Comparator<T>,
        zombie_time: Option<Duration>,
        free_action: FreeAction<T>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            core: DerivationCore::new(zombie_time),
            me: me.clone(),
            func,
            value: RefCell::new(None),
            comparator,
            free_action,
            scope: false,
        })
    }

    /// A computed that evaluates in the `Scope` state.
    pub(crate) fn scope(func: Box<dyn Fn() -> Result<T>>) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            core: DerivationCore::new(None),
            me: me.clone(),
            func,
            value: RefCell::new(None),
            comparator: Rc::new(|_: &T, _: &T| false),
            free_action: FreeAction::Keep,
            scope: true,
        })
    }

    pub(crate) fn core(&self) -> &DerivationCore {
        &self.core
    }

    /// The cached result, if any.
    pub(crate) fn peek(&self) -> Option<Result<T>> {
        self.value.borrow().clone()
    }

    /// Read the value, bringing it up to date and recording the read.
    pub(crate) fn run(&self) -> Result<T> {
        match self.core.state() {
            ComputedState::Updating | ComputedState::Scope => {
                return Err(Error::RecursiveComputed)
            }
            ComputedState::PermanentlyDead => return Err(Error::Disposed),
            ComputedState::Zombie => self.core.set_state(ComputedState::Updated),
            _ => {}
        }
        let was_update = self.update_if_needed()?;
        let outside = self.mark_usage();
        if was_update && outside {
            if let Some(me) = self.rc() {
                scheduler::bury_later(&me);
            }
        }
        self.peek().unwrap_or(Err(Error::Interrupted))
    }

    /// Store `outcome`, returning whether it differs from the previous one.
    fn store(&self, outcome: Result<T>, first: bool) -> bool {
        let previous = match self.value.borrow().as_ref() {
            Some(old) if !first => Some(same_outcome(&self.comparator, old, &outcome)),
            _ => None,
        };
        if previous == Some(true) {
            return false;
        }
        *self.value.borrow_mut() = Some(outcome);
        previous.is_some()
    }
}

impl<T: Clone + 'static> Derivation for ComputedImpl<T> {
    fn core(&self) -> &DerivationCore {
        &self.core
    }

    fn rc(&self) -> Option<Rc<dyn Derivation>> {
        self.me.upgrade().map(|me| me as Rc<dyn Derivation>)
    }

    fn update(&self) -> Result<()> {
        let core = &self.core;
        if interrupt::already_interrupted() && core.partial_results() {
            interrupt::set_partial_results();
            return Ok(());
        }
        let Some(me) = self.rc() else {
            return Ok(());
        };
        let guard = ReactiveContext::enter(Reader::Derivation(me));
        core.set_partial_results(false);
        core.free_usings();
        let first = core.state() == ComputedState::First;
        core.set_state(if self.scope {
            ComputedState::Scope
        } else {
            ComputedState::Updating
        });
        let outcome = (self.func)();
        let changed = self.store(outcome, first);
        let partial = interrupt::already_interrupted();
        core.set_partial_results(partial);
        if core.state() != ComputedState::PermanentlyDead {
            core.set_state(ComputedState::Updated);
        }
        drop(guard);

        let result = if changed {
            self.invalidate_dependents()
        } else {
            Ok(())
        };
        if partial && core.state() == ComputedState::Updated {
            core.set_state(ComputedState::NeedRecheck);
            interrupt::set_partial_results();
        }
        result
    }

    fn free(&self) {
        self.core.free_usings_and_bury();
        self.core.set_partial_results(false);
        let value = self.value.borrow_mut().take();
        let value = value.as_ref().and_then(|v| v.as_ref().ok());
        match &self.free_action {
            FreeAction::Keep => {}
            FreeAction::Notify(hook) => hook(value),
            FreeAction::Detach(hook) => {
                self.core.set_state(ComputedState::PermanentlyDead);
                hook(self.core.id(), value);
            }
        }
    }
}

/// A memoized derived value.
///
/// Cloning the handle shares the computed.
///
/// # Example
///
/// ```rust
/// use rill_core::reactive::{Computed, ObservableValue};
///
/// let count = ObservableValue::new(5);
/// let doubled = Computed::new({
///     let count = count.clone();
///     move || Ok(count.get() * 2)
/// });
///
/// assert_eq!(doubled.get().unwrap(), 10);
/// count.set(10).unwrap();
/// assert_eq!(doubled.get().unwrap(), 20);
/// ```
pub struct Computed<T> {
    inner: Rc<ComputedImpl<T>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + SameValue + 'static> Computed<T> {
    /// A computed whose changes are detected with [`SameValue::same_value`].
    pub fn new(f: impl Fn() -> Result<T> + 'static) -> Self {
        Self::with_comparator(f, |a: &T, b: &T| a.same_value(b))
    }

    /// A computed whose changes are detected with [`SameValue::deep_equal`].
    pub fn structural(f: impl Fn() -> Result<T> + 'static) -> Self {
        Self::with_comparator(f, |a: &T, b: &T| a.deep_equal(b))
    }

    /// A computed configured by `options`. Parameter hashing fields are ignored.
    pub fn with_options(f: impl Fn() -> Result<T> + 'static, options: ComputedOptions<(), T>) -> Self {
        let comparator = options.comparator_or_default();
        let free_action = match options.on_free {
            Some(on_free) => FreeAction::Notify(Box::new(move |value| on_free(value, &()))),
            None => FreeAction::Keep,
        };
        Self {
            inner: ComputedImpl::new(Box::new(f), comparator, options.zombie_time, free_action),
        }
    }
}

impl<T: Clone + 'static> Computed<T> {
    /// A computed whose changes are decided by `comparator` instead of the same-value test.
    pub fn with_comparator(
        f: impl Fn() -> Result<T> + 'static,
        comparator: impl Fn(&T, &T) -> bool + 'static,
    ) -> Self {
        Self {
            inner: ComputedImpl::new(Box::new(f), Rc::new(comparator), None, FreeAction::Keep),
        }
    }

    pub(crate) fn from_impl(inner: Rc<ComputedImpl<T>>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Rc<ComputedImpl<T>> {
        &self.inner
    }

    /// Get the current value, re-evaluating if needed and recording the read.
    ///
    /// A failure inside the computation is returned here every time the
    /// computed is read, until a source changes.
    pub fn get(&self) -> Result<T> {
        self.inner.run()
    }

    /// The computed's node id.
    pub fn id(&self) -> NodeId {
        self.inner.core.id()
    }

    /// Where the computed is in its evaluation cycle.
    pub fn state(&self) -> ComputedState {
        self.inner.core.state()
    }

    /// Free the computed for good. Later reads fail with [`Error::Disposed`].
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Whether [`dispose`](Self::dispose) was called.
    pub fn is_disposed(&self) -> bool {
        self.state() == ComputedState::PermanentlyDead
    }

    /// Whether the last evaluation was cut short by the time budget.
    pub fn has_partial_results(&self) -> bool {
        self.inner.core.partial_results()
    }

    /// Number of sources read by the last evaluation.
    pub fn dependency_count(&self) -> usize {
        self.inner.core.using_count()
    }

    /// Number of readers currently depending on this computed.
    pub fn dependent_count(&self) -> usize {
        self.inner.core.used_by_count()
    }

    /// Whether both handles refer to the same computed.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone + fmt::Debug + 'static> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("value", &self.inner.peek())
            .finish()
    }
}

/// Run `callback` once, the next time the computed being evaluated is
/// invalidated by a direct source.
pub fn debug_run_when_invalidated(callback: impl Fn() + 'static) -> Result<()> {
    match ReactiveContext::current() {
        Some(Reader::Derivation(derivation)) => {
            derivation.core().set_on_invalidated(Some(Rc::new(callback)));
            Ok(())
        }
        _ => Err(Error::NotInComputed {
            operation: "debug_run_when_invalidated",
        }),
    }
}
