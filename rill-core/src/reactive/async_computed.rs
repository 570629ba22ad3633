//! Async Computeds
//!
//! An async computed derives its value from a future. While the future is
//! pending the computed is busy; partial results can be published along the
//! way, and the final output becomes the result.
//!
//! # How Async Computeds Work
//!
//! 1. Reading the computed starts a run: the factory creates a future, and
//!    the future is polled once with the computed as the current reader, so
//!    every source it reads is tracked.
//! 2. If the future is pending, the computed enters `Waiting` and the run is
//!    parked. Its waker queues a resume, which happens in
//!    [`Runtime::poll_async`](crate::reactive::Runtime::poll_async) or at the
//!    start of the next frame.
//! 3. Values passed to [`AsyncContext::publish`] replace the result at once
//!    and notify readers if they differ from the previous result.
//! 4. When the future completes, its output (or error) becomes the result and
//!    readers are notified, since `busy` flipped.
//! 5. A source change while the run is parked cancels it. The next read
//!    starts a fresh run.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::{scheduler, NodeId, Reader};
use crate::observable::SameValue;

use super::computed::{same_outcome, Comparator, ComputedOptions, FreeAction};
use super::context::ReactiveContext;
use super::derivation::{ComputedState, Derivation, DerivationCore};
use super::interrupt;

pub(crate) type Task<T> = LocalBoxFuture<'static, Result<T>>;
pub(crate) type Factory<T> = Box<dyn Fn(AsyncContext<T>) -> Task<T>>;

/// A parked async run that can be resumed by the scheduler.
pub(crate) trait AsyncStep {
    fn resume(&self, generation: u64) -> Result<()>;
}

/// Handle given to an async computed's future for the run it belongs to.
pub struct AsyncContext<T> {
    target: Weak<AsyncComputedImpl<T>>,
    generation: u64,
}

impl<T> Clone for AsyncContext<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            generation: self.generation,
        }
    }
}

impl<T: Clone + 'static> AsyncContext<T> {
    /// Publish a partial result. Ignored once the run was cancelled.
    pub fn publish(&self, value: T) -> Result<()> {
        match self.target.upgrade() {
            Some(target) if target.generation.get() == self.generation => target.publish(value),
            _ => Ok(()),
        }
    }

    /// Whether this run is still the computed's current one.
    pub fn is_current(&self) -> bool {
        self.target
            .upgrade()
            .is_some_and(|target| target.generation.get() == self.generation)
    }
}

impl<T> fmt::Debug for AsyncContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncContext")
            .field("generation", &self.generation)
            .finish()
    }
}

pub(crate) struct AsyncComputedImpl<T> {
    core: DerivationCore,
    me: Weak<AsyncComputedImpl<T>>,
    factory: Factory<T>,
    task: RefCell<Option<Task<T>>>,
    value: RefCell<Option<Result<T>>>,
    comparator: Comparator<T>,
    generation: Cell<u64>,
    free_action: FreeAction<T>,
}

impl<T: Clone + 'static> AsyncComputedImpl<T> {
    pub(crate) fn new(
        factory: Factory<T>,
        comparator: Comparator<T>,
        zombie_time: Option<std::time::Duration>,
        free_action: FreeAction<T>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            core: DerivationCore::new(zombie_time),
            me: me.clone(),
            factory,
            task: RefCell::new(None),
            value: RefCell::new(None),
            comparator,
            generation: Cell::new(0),
            free_action,
        })
    }

    fn check_recursion(&self) -> Result<()> {
        if self.core.state() == ComputedState::Updating {
            return Err(Error::RecursiveComputed);
        }
        Ok(())
    }

    /// Start or join a run and record the read.
    pub(crate) fn run(&self) -> Result<AsyncResult<T>> {
        let Some(me) = self.me.upgrade() else {
            return Err(Error::Disposed);
        };
        match self.core.state() {
            ComputedState::PermanentlyDead => return Err(Error::Disposed),
            ComputedState::Zombie => self.core.set_state(ComputedState::Updated),
            _ => {}
        }
        if self.core.state() != ComputedState::Waiting {
            self.check_recursion()?;
            self.update_if_needed()?;
        }
        self.mark_usage();
        Ok(AsyncResult { inner: me })
    }

    /// Store `outcome`, returning whether it differs from the previous one.
    fn store(&self, outcome: Result<T>) -> bool {
        let same = match self.value.borrow().as_ref() {
            Some(old) => same_outcome(&self.comparator, old, &outcome),
            None => false,
        };
        if !same {
            *self.value.borrow_mut() = Some(outcome);
        }
        !same
    }

    fn publish(&self, value: T) -> Result<()> {
        let changed = self.store(Ok(value));
        if interrupt::already_interrupted() {
            self.core.set_partial_results(true);
        }
        if changed {
            return self.invalidate_dependents();
        }
        Ok(())
    }

    fn cancel(&self) {
        self.task.borrow_mut().take();
        self.generation.set(self.generation.get() + 1);
        scheduler::unregister_async(self.core.id());
    }

    fn poll_task(&self, mut task: Task<T>, generation: u64, fresh: bool) -> Result<()> {
        let waker = scheduler::waker_for(self.core.id(), generation);
        let mut cx = Context::from_waker(&waker);
        match task.as_mut().poll(&mut cx) {
            Poll::Pending => {
                if self.generation.get() != generation
                    || self.core.state() != ComputedState::Updating
                {
                    return Ok(());
                }
                *self.task.borrow_mut() = Some(task);
                self.core.set_state(ComputedState::Waiting);
                let step: Weak<dyn AsyncStep> = self.me.clone();
                scheduler::register_async(self.core.id(), step);
                if fresh {
                    return self.invalidate_dependents();
                }
                Ok(())
            }
            Poll::Ready(outcome) => {
                if self.generation.get() != generation {
                    return Ok(());
                }
                self.settle(outcome)
            }
        }
    }

    fn settle(&self, outcome: Result<T>) -> Result<()> {
        self.store(outcome);
        if interrupt::already_interrupted() {
            self.core.set_partial_results(true);
        }
        self.core.set_state(ComputedState::Updated);
        scheduler::unregister_async(self.core.id());
        debug!(node = self.core.id().raw(), "async computed settled");
        self.invalidate_dependents()
    }
}

impl<T: Clone + 'static> AsyncStep for AsyncComputedImpl<T> {
    fn resume(&self, generation: u64) -> Result<()> {
        if self.generation.get() != generation || self.core.state() != ComputedState::Waiting {
            return Ok(());
        }
        let Some(task) = self.task.borrow_mut().take() else {
            return Ok(());
        };
        let Some(me) = self.rc() else {
            return Ok(());
        };
        let _guard = ReactiveContext::enter(Reader::Derivation(me));
        self.core.set_state(ComputedState::Updating);
        self.poll_task(task, generation, false)
    }
}

impl<T: Clone + 'static> Derivation for AsyncComputedImpl<T> {
    fn core(&self) -> &DerivationCore {
        &self.core
    }

    fn rc(&self) -> Option<Rc<dyn Derivation>> {
        self.me.upgrade().map(|me| me as Rc<dyn Derivation>)
    }

    fn waiting_invalidate(&self) -> Result<ComputedState> {
        debug!(node = self.core.id().raw(), "cancelling parked async run");
        self.cancel();
        self.core.set_state(ComputedState::NeedRecheck);
        self.propagate_soft()?;
        Ok(ComputedState::NeedRecheck)
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
        self.cancel();
        let _guard = ReactiveContext::enter(Reader::Derivation(me));
        core.set_partial_results(false);
        core.free_usings();
        core.set_state(ComputedState::Updating);
        let generation = self.generation.get();
        let task = (self.factory)(AsyncContext {
            target: self.me.clone(),
            generation,
        });
        self.poll_task(task, generation, true)
    }

    fn free(&self) {
        self.cancel();
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

/// The observable view of an async computed's current run.
pub struct AsyncResult<T> {
    inner: Rc<AsyncComputedImpl<T>>,
}

impl<T> Clone for AsyncResult<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> AsyncResult<T> {
    /// Whether a run is in progress. Records the read.
    pub fn busy(&self) -> Result<bool> {
        self.inner.check_recursion()?;
        self.inner.mark_usage();
        Ok(matches!(
            self.inner.core.state(),
            ComputedState::Updating | ComputedState::Waiting
        ))
    }

    /// The latest published or final result. Records the read.
    pub fn result(&self) -> Result<Option<T>> {
        self.inner.check_recursion()?;
        self.inner.mark_usage();
        match self.inner.value.borrow().as_ref() {
            None => Ok(None),
            Some(Ok(value)) => Ok(Some(value.clone())),
            Some(Err(err)) => Err(err.clone()),
        }
    }

    /// Whether both views come from the same run.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> fmt::Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResult")
            .field("id", &self.inner.core.id())
            .field("state", &self.inner.core.state())
            .finish()
    }
}

pub(crate) fn boxed_factory<T, F, Fut>(factory: F) -> Factory<T>
where
    T: 'static,
    F: Fn(AsyncContext<T>) -> Fut + 'static,
    Fut: Future<Output = Result<T>> + 'static,
{
    Box::new(move |cx| factory(cx).boxed_local())
}

/// A computed value produced by a future.
///
/// # Example
///
/// ```rust
/// use rill_core::reactive::{AsyncComputed, AsyncContext};
///
/// let greeting = AsyncComputed::new(|cx: AsyncContext<String>| async move {
///     cx.publish("loading".to_string())?;
///     Ok("hello".to_string())
/// });
///
/// let run = greeting.run().unwrap();
/// assert!(!run.busy().unwrap());
/// assert_eq!(run.result().unwrap().as_deref(), Some("hello"));
/// ```
pub struct AsyncComputed<T> {
    inner: Rc<AsyncComputedImpl<T>>,
}

impl<T> Clone for AsyncComputed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + SameValue + 'static> AsyncComputed<T> {
    /// Create an async computed that lingers for the configured
    /// `async_zombie_time` after its last reader goes away.
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: Fn(AsyncContext<T>) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        let zombie_time = scheduler::config().async_zombie_time;
        Self {
            inner: AsyncComputedImpl::new(
                boxed_factory(factory),
                Rc::new(|a: &T, b: &T| a.same_value(b)),
                zombie_time,
                FreeAction::Keep,
            ),
        }
    }

    /// An async computed configured by `options`.
    pub fn with_options<F, Fut>(factory: F, options: ComputedOptions<(), T>) -> Self
    where
        F: Fn(AsyncContext<T>) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        let comparator = options.comparator_or_default();
        let free_action = match options.on_free {
            Some(on_free) => FreeAction::Notify(Box::new(move |value| on_free(value, &()))),
            None => FreeAction::Keep,
        };
        Self {
            inner: AsyncComputedImpl::new(
                boxed_factory(factory),
                comparator,
                options.zombie_time,
                free_action,
            ),
        }
    }
}

impl<T: Clone + 'static> AsyncComputed<T> {
    /// Start (or join) a run and return its observable view.
    pub fn run(&self) -> Result<AsyncResult<T>> {
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

    /// Cancel any run in flight and free the computed for good.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Whether [`dispose`](Self::dispose) was called.
    pub fn is_disposed(&self) -> bool {
        self.state() == ComputedState::PermanentlyDead
    }
}

impl<T> fmt::Debug for AsyncComputed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncComputed")
            .field("id", &self.inner.core.id())
            .field("state", &self.inner.core.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{ObservableValue, Runtime};
    use std::collections::VecDeque;
    use tokio::sync::oneshot;

    #[test]
    fn publishes_partials_then_resolves() {
        let (tx, rx) = oneshot::channel::<i32>();
        let rx = RefCell::new(Some(rx));
        let computed = AsyncComputed::new(move |cx: AsyncContext<i32>| {
            let rx = rx.borrow_mut().take();
            async move {
                cx.publish(1)?;
                cx.publish(2)?;
                let result = match rx {
                    Some(rx) => rx.await.map_err(|_| Error::Cancelled)?,
                    None => 0,
                };
                Ok(2 + result)
            }
        });

        let first = computed.run().unwrap();
        assert!(first.busy().unwrap());
        assert_eq!(first.result().unwrap(), Some(2));
        let second = computed.run().unwrap();
        assert!(second.ptr_eq(&first));

        tx.send(1).unwrap();
        assert_eq!(Runtime::poll_async().unwrap(), 1);
        assert!(!first.busy().unwrap());
        assert_eq!(first.result().unwrap(), Some(3));
    }

    #[test]
    fn failure_surfaces_in_result() {
        let (tx, rx) = oneshot::channel::<Result<()>>();
        let rx = RefCell::new(Some(rx));
        let computed = AsyncComputed::new(move |_cx: AsyncContext<()>| {
            let rx = rx.borrow_mut().take();
            async move {
                match rx {
                    Some(rx) => rx.await.map_err(|_| Error::Cancelled)?,
                    None => Ok(()),
                }
            }
        });

        let run = computed.run().unwrap();
        assert!(run.busy().unwrap());
        assert_eq!(run.result().unwrap(), None);

        tx.send(Err(Error::msg("OK"))).unwrap();
        Runtime::poll_async().unwrap();
        assert!(!run.busy().unwrap());
        assert_eq!(run.result(), Err(Error::msg("OK")));
    }

    #[test]
    fn source_change_cancels_parked_run() {
        let source = ObservableValue::new(1);
        let gates: Rc<RefCell<VecDeque<oneshot::Receiver<()>>>> = Rc::default();
        let computed = AsyncComputed::new({
            let (source, gates) = (source.clone(), gates.clone());
            move |cx: AsyncContext<i32>| {
                let value = source.get();
                let gate = gates.borrow_mut().pop_front();
                async move {
                    cx.publish(value)?;
                    if let Some(gate) = gate {
                        gate.await.map_err(|_| Error::Cancelled)?;
                    }
                    Ok(value * 10)
                }
            }
        });

        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        gates.borrow_mut().extend([first_rx, second_rx]);

        let run = computed.run().unwrap();
        assert_eq!(run.result().unwrap(), Some(1));
        assert_eq!(computed.state(), ComputedState::Waiting);

        source.set(2).unwrap();
        assert_eq!(computed.state(), ComputedState::NeedRecheck);
        assert!(first_tx.send(()).is_err());

        let run = computed.run().unwrap();
        assert!(run.busy().unwrap());
        assert_eq!(run.result().unwrap(), Some(2));

        second_tx.send(()).unwrap();
        Runtime::poll_async().unwrap();
        assert_eq!(run.result().unwrap(), Some(20));
    }

    #[test]
    fn disposed_computed_refuses_runs() {
        let computed = AsyncComputed::new(|_cx: AsyncContext<i32>| async { Ok(1) });
        assert_eq!(computed.run().unwrap().result().unwrap(), Some(1));
        computed.dispose();
        assert!(matches!(computed.run(), Err(Error::Disposed)));
    }
}
