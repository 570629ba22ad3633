//! Derivations
//!
//! A derivation is a reader that is also a node: a computed, a reaction or
//! an async computed. This module holds the state machine and the edge
//! bookkeeping they share.
//!
//! # State Machine
//!
//! ```text
//!   First ──update──▶ Updating ──▶ Updated
//!                                    │  ▲
//!              direct source changed │  │ update / recheck found nothing
//!                                    ▼  │
//!   NeedRecheck ◀── NeedDepsRecheck ◀┘ (an upstream derivation may change)
//! ```
//!
//! - A direct source change sends `Updated` (or `NeedDepsRecheck`) to
//!   `NeedRecheck`, and every dependent derivation is soft-invalidated to
//!   `NeedDepsRecheck`.
//! - `NeedDepsRecheck` is resolved lazily: upstream derivations are brought up
//!   to date in order, and if one of them really changed it invalidates us
//!   into `NeedRecheck`.
//! - A derivation nobody reads any more is buried: freed back to `First`, or
//!   kept as a `Zombie` for a grace period first.
//! - `PermanentlyDead` is terminal.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::graph::{self, scheduler, Edges, NodeId, Reader, Source, WeakReader};

/// Lifecycle state of a derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputedState {
    /// Never evaluated, or freed.
    First,
    /// A direct source changed.
    NeedRecheck,
    /// Evaluating right now.
    Updating,
    /// Up to date.
    Updated,
    /// An upstream derivation may have changed.
    NeedDepsRecheck,
    /// Running as a reactive scope.
    Scope,
    /// Disposed. Terminal.
    PermanentlyDead,
    /// An async run is suspended.
    Waiting,
    /// Unread, waiting out its grace period before being freed.
    Zombie,
}

pub(crate) type OnInvalidated = Rc<dyn Fn()>;

/// State and edges shared by every derivation kind.
pub(crate) struct DerivationCore {
    id: NodeId,
    state: Cell<ComputedState>,
    using: RefCell<Edges<Source>>,
    used_by: RefCell<Edges<WeakReader>>,
    partial_results: Cell<bool>,
    zombie_time: Option<Duration>,
    zombie_counter: Cell<u64>,
    on_invalidated: RefCell<Option<OnInvalidated>>,
}

impl DerivationCore {
    pub(crate) fn new(zombie_time: Option<Duration>) -> Self {
        Self {
            id: NodeId::new(),
            state: Cell::new(ComputedState::First),
            using: RefCell::new(Edges::new()),
            used_by: RefCell::new(Edges::new()),
            partial_results: Cell::new(false),
            zombie_time,
            zombie_counter: Cell::new(0),
            on_invalidated: RefCell::new(None),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn state(&self) -> ComputedState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: ComputedState) {
        self.state.set(state);
    }

    pub(crate) fn partial_results(&self) -> bool {
        self.partial_results.get()
    }

    pub(crate) fn set_partial_results(&self, partial: bool) {
        self.partial_results.set(partial);
    }

    pub(crate) fn zombie_counter(&self) -> u64 {
        self.zombie_counter.get()
    }

    pub(crate) fn set_on_invalidated(&self, callback: Option<OnInvalidated>) {
        *self.on_invalidated.borrow_mut() = callback;
    }

    fn fire_on_invalidated(&self) {
        let callback = self.on_invalidated.borrow_mut().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    pub(crate) fn mark_using(&self, source: NodeId, make: impl FnOnce() -> Source) -> bool {
        let mut using = self.using.borrow_mut();
        if using.contains_key(&source) {
            return false;
        }
        using.insert(source, make());
        true
    }

    pub(crate) fn remove_using(&self, source: NodeId) -> bool {
        self.using.borrow_mut().shift_remove(&source).is_some()
    }

    pub(crate) fn using_count(&self) -> usize {
        self.using.borrow().len()
    }

    pub(crate) fn used_by_count(&self) -> usize {
        self.used_by.borrow().len()
    }

    /// Upstream derivations in the order they were first read.
    fn derivation_sources(&self) -> SmallVec<[Rc<dyn Derivation>; 8]> {
        self.using
            .borrow()
            .values()
            .filter_map(|source| match source {
                Source::Derivation(derivation) => Some(derivation.clone()),
                Source::Atom(_) => None,
            })
            .collect()
    }

    fn readers(&self) -> SmallVec<[WeakReader; 8]> {
        self.used_by.borrow().values().cloned().collect()
    }

    /// Release all upstream edges.
    pub(crate) fn free_usings(&self) {
        let using = std::mem::take(&mut *self.using.borrow_mut());
        for source in using.values() {
            source.unmark(self.id);
        }
    }

    /// Release all upstream edges and bury upstream derivations left unread.
    pub(crate) fn free_usings_and_bury(&self) {
        let using = std::mem::take(&mut *self.using.borrow_mut());
        for source in using.values() {
            source.unmark(self.id);
            if let Source::Derivation(derivation) = source {
                derivation.bury_if_dead();
            }
        }
    }
}

impl Drop for DerivationCore {
    fn drop(&mut self) {
        let using = std::mem::take(self.using.get_mut());
        for source in using.values() {
            source.unmark(self.id);
        }
    }
}

/// Behaviour shared by computeds, reactions and async computeds.
///
/// Implementors provide evaluation and cleanup; edge bookkeeping and the
/// state transitions live in the provided methods.
pub(crate) trait Derivation {
    fn core(&self) -> &DerivationCore;

    /// A strong handle to self, unless self is being dropped.
    fn rc(&self) -> Option<Rc<dyn Derivation>>;

    /// Re-evaluate.
    fn update(&self) -> Result<()>;

    /// Release edges and the cached result.
    fn free(&self);

    /// Abandon a suspended async run. Returns the state to continue with.
    fn waiting_invalidate(&self) -> Result<ComputedState> {
        Ok(self.core().state())
    }

    fn id(&self) -> NodeId {
        self.core().id()
    }

    /// The direct source `source` changed.
    fn invalidate_by(&self, source: NodeId) -> Result<()> {
        let core = self.core();
        if !core.remove_using(source) {
            return Ok(());
        }
        let mut state = core.state();
        if state == ComputedState::Waiting {
            state = self.waiting_invalidate()?;
        }
        trace!(node = core.id().raw(), source = source.raw(), ?state, "invalidated");
        match state {
            ComputedState::Updating => return Err(Error::ModifiedDuringUpdate),
            ComputedState::Zombie => {
                core.set_state(ComputedState::First);
                self.free();
                return Ok(());
            }
            ComputedState::Updated | ComputedState::NeedDepsRecheck => {
                core.fire_on_invalidated();
                core.set_state(ComputedState::NeedRecheck);
                let propagated = self.propagate_soft();
                core.free_usings();
                return propagated;
            }
            _ => {}
        }
        core.free_usings();
        Ok(())
    }

    /// An upstream derivation may have changed.
    fn soft_invalidate(&self) -> Result<()> {
        let core = self.core();
        let mut state = core.state();
        if state == ComputedState::Waiting {
            state = self.waiting_invalidate()?;
        }
        match state {
            ComputedState::Updating => Err(Error::ModifiedDuringUpdate),
            ComputedState::Zombie => {
                core.set_state(ComputedState::First);
                self.free();
                Ok(())
            }
            ComputedState::Updated => {
                core.set_state(ComputedState::NeedDepsRecheck);
                self.propagate_soft()
            }
            _ => Ok(()),
        }
    }

    /// Soft-invalidate dependent derivations; queue self if a host reads it.
    fn propagate_soft(&self) -> Result<()> {
        let mut used_by_host = false;
        let mut result = Ok(());
        for reader in self.core().readers() {
            match reader.upgrade() {
                Some(Reader::Derivation(derivation)) => {
                    if let Err(err) = derivation.soft_invalidate() {
                        result = Err(err);
                    }
                }
                Some(Reader::Host(_)) => used_by_host = true,
                None => {}
            }
        }
        if used_by_host {
            if let Some(me) = self.rc() {
                scheduler::schedule_update(me);
            }
        }
        result
    }

    /// Our own value changed: notify and forget every reader.
    fn invalidate_dependents(&self) -> Result<()> {
        let core = self.core();
        let readers = std::mem::take(&mut *core.used_by.borrow_mut());
        let result = graph::notify_readers(core.id(), readers);
        if let Some(me) = self.rc() {
            scheduler::bury_later(&me);
        }
        result
    }

    fn unmark_used_by(&self, reader: NodeId) {
        let empty = {
            let mut used_by = self.core().used_by.borrow_mut();
            used_by.shift_remove(&reader);
            used_by.is_empty()
        };
        if empty {
            if let Some(me) = self.rc() {
                scheduler::bury_later(&me);
            }
        }
    }

    /// Record a read by the current reader. Returns true when read outside
    /// of any reader.
    fn mark_usage(&self) -> bool {
        let Some(me) = self.rc() else {
            return true;
        };
        let core = self.core();
        graph::track(core.id(), || Source::Derivation(me), &core.used_by)
    }

    /// Bring this derivation up to date. Returns true when it re-evaluated.
    fn update_if_needed(&self) -> Result<bool> {
        let core = self.core();
        if core.state() == ComputedState::NeedDepsRecheck {
            for source in core.derivation_sources() {
                source.update_if_needed()?;
                if core.state() != ComputedState::NeedDepsRecheck {
                    break;
                }
            }
            if core.state() == ComputedState::NeedDepsRecheck {
                core.set_state(ComputedState::Updated);
                return Ok(false);
            }
        }
        if matches!(
            core.state(),
            ComputedState::Updated | ComputedState::Waiting | ComputedState::Scope
        ) {
            return Ok(false);
        }
        self.update()?;
        Ok(true)
    }

    /// Frame-drain entry point: dead derivations stay dead.
    fn update_if_needed_without_resurrecting(&self) -> Result<()> {
        if self.core().state() == ComputedState::PermanentlyDead {
            return Ok(());
        }
        self.update_if_needed().map(|_| ())
    }

    /// Free self if nothing reads it any more.
    fn bury_if_dead(&self) {
        let core = self.core();
        if core.used_by_count() > 0 {
            return;
        }
        scheduler::forget_dead(core.id());
        match core.state() {
            ComputedState::Zombie
            | ComputedState::Waiting
            | ComputedState::Updating
            | ComputedState::Scope
            | ComputedState::PermanentlyDead => return,
            _ => {}
        }
        if let Some(zombie_time) = core.zombie_time {
            core.set_state(ComputedState::Zombie);
            let counter = core.zombie_counter.get() + 1;
            core.zombie_counter.set(counter);
            if let Some(me) = self.rc() {
                scheduler::schedule_zombie(&me, counter, zombie_time);
            }
            return;
        }
        debug!(node = core.id().raw(), "burying derivation");
        core.set_state(ComputedState::First);
        self.free();
    }

    /// Permanently stop this derivation.
    fn dispose(&self) {
        let core = self.core();
        scheduler::forget_dead(core.id());
        core.set_state(ComputedState::PermanentlyDead);
        self.free();
    }
}
