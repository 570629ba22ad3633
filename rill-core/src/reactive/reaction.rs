//! Reactions
//!
//! A reaction tracks an expression and runs an effect whenever the
//! expression's result changes. Unlike computeds, reactions are eager: a
//! change queues them for the next frame.
//!
//! # How Reactions Work
//!
//! 1. On creation the reaction is queued and asks the host for a frame.
//! 2. During the frame drain, the expression runs tracked. If its result
//!    changed, the effect runs untracked with the new value.
//! 3. When a source changes, the reaction queues itself again.
//! 4. Dropping the [`Reaction`] handle (or calling [`Disposer::dispose`])
//!    stops it for good.
//!
//! An expression that fails is logged and the effect is skipped.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::warn;

use crate::error::Result;
use crate::graph::{scheduler, NodeId, Reader};
use crate::observable::SameValue;

use super::computed::{same_outcome, Comparator};
use super::context::{untracked, ReactiveContext};
use super::derivation::{ComputedState, Derivation, DerivationCore};
use super::interrupt;

type Expression<T> = Box<dyn Fn(&Disposer) -> Result<T>>;
type Effect<T> = Box<dyn Fn(&T, &Disposer)>;

struct ReactionImpl<T> {
    core: DerivationCore,
    me: Weak<ReactionImpl<T>>,
    expression: Expression<T>,
    effect: Effect<T>,
    value: RefCell<Option<Result<T>>>,
    comparator: Comparator<T>,
}

impl<T: Clone + 'static> ReactionImpl<T> {
    fn disposer(&self) -> Disposer {
        let target: Weak<dyn Derivation> = self.me.clone();
        Disposer { target }
    }

    fn schedule(&self) {
        if let Some(me) = self.rc() {
            scheduler::schedule_update(me);
        }
    }

    fn run_effect(&self) {
        let value = self.value.borrow().clone();
        match value {
            Some(Ok(value)) => {
                let disposer = self.disposer();
                untracked(|| (self.effect)(&value, &disposer));
            }
            Some(Err(err)) => {
                warn!(reaction = self.core.id().raw(), error = %err, "reaction expression failed");
            }
            None => {}
        }
    }
}

impl<T: Clone + 'static> Derivation for ReactionImpl<T> {
    fn core(&self) -> &DerivationCore {
        &self.core
    }

    fn rc(&self) -> Option<Rc<dyn Derivation>> {
        self.me.upgrade().map(|me| me as Rc<dyn Derivation>)
    }

    fn invalidate_by(&self, source: NodeId) -> Result<()> {
        if !self.core.remove_using(source) {
            return Ok(());
        }
        let state = self.core.state();
        if matches!(state, ComputedState::Updated | ComputedState::NeedDepsRecheck) {
            self.core.set_state(ComputedState::NeedRecheck);
            self.schedule();
        }
        self.core.free_usings();
        Ok(())
    }

    fn soft_invalidate(&self) -> Result<()> {
        if self.core.state() == ComputedState::Updated {
            self.core.set_state(ComputedState::NeedDepsRecheck);
            self.schedule();
        }
        Ok(())
    }

    fn bury_if_dead(&self) {}

    fn update(&self) -> Result<()> {
        let core = &self.core;
        if interrupt::already_interrupted() && core.partial_results() {
            interrupt::set_partial_results();
            return Ok(());
        }
        let Some(me) = self.rc() else {
            return Ok(());
        };
        let disposer = self.disposer();
        let guard = ReactiveContext::enter(Reader::Derivation(me));
        core.set_partial_results(false);
        core.free_usings();
        let first = core.state() == ComputedState::First;
        core.set_state(ComputedState::Updated);
        let outcome = (self.expression)(&disposer);
        let changed = {
            let previous = self.value.borrow();
            first
                || match previous.as_ref() {
                    Some(old) => !same_outcome(&self.comparator, old, &outcome),
                    None => true,
                }
        };
        if changed {
            *self.value.borrow_mut() = Some(outcome);
        }
        let partial = interrupt::already_interrupted();
        core.set_partial_results(partial);
        drop(guard);

        if core.state() == ComputedState::PermanentlyDead {
            core.free_usings();
        } else if partial {
            core.set_state(ComputedState::NeedRecheck);
            interrupt::set_partial_results();
        }
        if changed && core.state() != ComputedState::PermanentlyDead {
            self.run_effect();
        }
        Ok(())
    }

    fn free(&self) {
        self.core.free_usings_and_bury();
        self.value.borrow_mut().take();
    }
}

/// Stops a reaction from inside its own expression or effect.
#[derive(Clone)]
pub struct Disposer {
    target: Weak<dyn Derivation>,
}

impl Disposer {
    /// Dispose the reaction this disposer belongs to.
    pub fn dispose(&self) {
        if let Some(target) = self.target.upgrade() {
            target.dispose();
        }
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("alive", &(self.target.strong_count() > 0))
            .finish()
    }
}

/// Handle to a running reaction. Dropping it disposes the reaction.
#[must_use = "dropping a Reaction disposes it"]
pub struct Reaction {
    inner: Rc<dyn Derivation>,
}

impl Reaction {
    /// The reaction's node id.
    pub fn id(&self) -> NodeId {
        self.inner.id()
    }

    /// Where the reaction is in its evaluation cycle.
    pub fn state(&self) -> ComputedState {
        self.inner.core().state()
    }

    /// Stop the reaction. It will not run again.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Whether the reaction was stopped.
    pub fn is_disposed(&self) -> bool {
        self.state() == ComputedState::PermanentlyDead
    }

    /// Number of sources read by the last run of the expression.
    pub fn dependency_count(&self) -> usize {
        self.inner.core().using_count()
    }
}

impl Drop for Reaction {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl fmt::Debug for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reaction")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

fn start<T: Clone + 'static>(
    expression: Expression<T>,
    effect: Effect<T>,
    comparator: Comparator<T>,
) -> Reaction {
    let inner = Rc::new_cyclic(|me| ReactionImpl {
        core: DerivationCore::new(None),
        me: me.clone(),
        expression,
        effect,
        value: RefCell::new(None),
        comparator,
    });
    inner.schedule();
    Reaction { inner }
}

/// Run `effect` whenever the result of `expression` changes.
///
/// Both run during the next frame drain
/// ([`Runtime::before_frame`](crate::reactive::Runtime::before_frame)).
pub fn reaction<T, E, F>(expression: E, effect: F) -> Reaction
where
    T: Clone + SameValue + 'static,
    E: Fn(&Disposer) -> Result<T> + 'static,
    F: Fn(&T, &Disposer) + 'static,
{
    start(
        Box::new(expression),
        Box::new(effect),
        Rc::new(|a: &T, b: &T| a.same_value(b)),
    )
}

/// Like [`reaction`], with a custom change comparator.
pub fn reaction_with_comparator<T, E, F, C>(expression: E, effect: F, comparator: C) -> Reaction
where
    T: Clone + 'static,
    E: Fn(&Disposer) -> Result<T> + 'static,
    F: Fn(&T, &Disposer) + 'static,
    C: Fn(&T, &T) -> bool + 'static,
{
    start(Box::new(expression), Box::new(effect), Rc::new(comparator))
}

/// Run `view` now and whenever anything it read changes.
pub fn autorun(view: impl Fn(&Disposer) -> Result<()> + 'static) -> Reaction {
    start(
        Box::new(view),
        Box::new(|_: &(), _: &Disposer| {}),
        Rc::new(|_: &(), _: &()| false),
    )
}

/// Run `effect` once, the first time `predicate` holds, then stop.
pub fn when(
    predicate: impl Fn() -> Result<bool> + 'static,
    effect: impl FnOnce() + 'static,
) -> Reaction {
    let effect = Cell::new(Some(effect));
    autorun(move |disposer| {
        if predicate()? {
            disposer.dispose();
            if let Some(effect) = effect.take() {
                untracked(effect);
            }
        }
        Ok(())
    })
}
