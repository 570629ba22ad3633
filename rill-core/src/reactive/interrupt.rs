//! Interruption
//!
//! Long computations can split their work across frames. Each frame grants a
//! time budget (see [`RuntimeConfig::time_budget`](crate::RuntimeConfig)).
//! Computations poll [`interrupted`] and stop early when it returns true,
//! leaving a partial result that is finished in a later frame.
//!
//! - The first reader to poll in a frame is always allowed to finish, so
//!   every frame makes progress.
//! - Once any reader is interrupted, every later poll in the frame returns
//!   true until the next frame starts.
//! - A derivation that produced partial results is re-evaluated on its next
//!   read, and whoever read it sees [`got_partial_results`] return true.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::graph::{scheduler, Edges, Reader};

use super::computed::{Computed, ComputedImpl};
use super::context::ReactiveContext;
use super::derivation::Derivation;

/// Whether the current computation should stop and return partial results.
pub fn interrupted() -> bool {
    let already = scheduler::with(|s| s.interruption.already_interrupted.get());
    if already {
        return true;
    }
    let ctx = ReactiveContext::current_id();
    scheduler::with(|s| {
        if s.interruption.first_interruptible.get().is_none() {
            s.interruption.first_interruptible.set(ctx);
        }
    });
    if got_partial_results() {
        return true;
    }
    if scheduler::have_time_budget() {
        return false;
    }
    if ctx == scheduler::with(|s| s.interruption.first_interruptible.get()) {
        return false;
    }
    if let Some(Reader::Host(host)) = ReactiveContext::current() {
        scheduler::invalidate_host(&host);
    }
    scheduler::with(|s| {
        s.interruption.already_interrupted.set(true);
        s.interruption.first_interruptible.set(None);
    });
    true
}

/// Whether something read by the current reader was only partially computed.
pub fn got_partial_results() -> bool {
    match ReactiveContext::current() {
        Some(Reader::Derivation(derivation)) => derivation.core().partial_results(),
        _ => scheduler::with(|s| s.interruption.outside_partial_results.get()),
    }
}

/// Clear the partial-results flag seen outside of derivations.
pub fn reset_got_partial_results() -> Result<()> {
    if ReactiveContext::in_derivation() {
        return Err(Error::InComputed {
            operation: "reset_got_partial_results",
        });
    }
    scheduler::with(|s| s.interruption.outside_partial_results.set(false));
    Ok(())
}

pub(crate) fn already_interrupted() -> bool {
    scheduler::with(|s| s.interruption.already_interrupted.get())
}

/// Report that the current reader consumed a partial result.
pub(crate) fn set_partial_results() {
    match ReactiveContext::current() {
        Some(Reader::Derivation(derivation)) => derivation.core().set_partial_results(true),
        Some(Reader::Host(host)) => scheduler::invalidate_host(&host),
        None => {}
    }
    scheduler::with(|s| s.interruption.outside_partial_results.set(true));
}

/// Set how long one frame may compute before work is interrupted.
pub fn set_time_budget(budget: Duration) {
    let config = scheduler::config().with_time_budget(budget);
    scheduler::set_config(config);
}

/// The current frame time budget.
pub fn time_budget() -> Duration {
    scheduler::config().time_budget
}

/// Evaluate `computed` once with its own interruption state.
pub(crate) fn run_scope<T: Clone + 'static>(
    computed: &Rc<ComputedImpl<T>>,
    bury: bool,
    continue_callback: Option<Rc<dyn Fn() -> bool>>,
) -> Result<bool> {
    let saved = scheduler::save_interruption();
    let saved_dead = bury.then(|| scheduler::swap_dead_set(Edges::new()));
    if let Some(callback) = continue_callback {
        scheduler::with(|s| {
            *s.interruption.budget_override.borrow_mut() = Some(callback);
            s.interruption.first_interruptible.set(None);
            s.interruption.already_interrupted.set(false);
        });
    }

    let updated = computed.update();
    let outcome = computed.peek();
    let partial = computed.core().partial_results();

    if let Some(saved_dead) = saved_dead {
        computed.bury_if_dead();
        scheduler::bury_dead_set();
        scheduler::swap_dead_set(saved_dead);
    }
    scheduler::restore_interruption(saved);

    updated?;
    if let Some(Err(err)) = outcome {
        return Err(err);
    }
    Ok(partial)
}

/// Re-evaluate `computed` now, outside the frame schedule.
///
/// With `bury` set, derivations that end up unread are freed before
/// returning. Returns whether the result is partial.
pub fn computed_scope<T: Clone + 'static>(computed: &Computed<T>, bury: bool) -> Result<bool> {
    run_scope(computed.inner(), bury, None)
}

/// Like [`computed_scope`], with `continue_callback` deciding the time budget.
pub fn computed_scope_with<T: Clone + 'static>(
    computed: &Computed<T>,
    bury: bool,
    continue_callback: impl Fn() -> bool + 'static,
) -> Result<bool> {
    run_scope(computed.inner(), bury, Some(Rc::new(continue_callback)))
}

fn scope_computed(scope: impl FnOnce() -> Result<()> + 'static) -> Rc<ComputedImpl<()>> {
    let scope = RefCell::new(Some(scope));
    ComputedImpl::scope(Box::new(move || {
        let scope = scope.borrow_mut().take();
        match scope {
            Some(scope) => scope(),
            None => Ok(()),
        }
    }))
}

/// Run `scope` as a one-off tracked evaluation, then free everything that is
/// left unread. Returns whether any result it consumed was partial.
pub fn reactive_scope(scope: impl FnOnce() -> Result<()> + 'static) -> Result<bool> {
    run_scope(&scope_computed(scope), true, None)
}

/// Like [`reactive_scope`], with `continue_callback` deciding the time budget.
pub fn reactive_scope_with(
    scope: impl FnOnce() -> Result<()> + 'static,
    continue_callback: impl Fn() -> bool + 'static,
) -> Result<bool> {
    run_scope(&scope_computed(scope), true, Some(Rc::new(continue_callback)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::ObservableValue;
    use std::cell::Cell;

    #[test]
    fn reset_is_refused_inside_computed() {
        let computed = Computed::new(|| reset_got_partial_results().map(|_| 0));
        assert_eq!(
            computed.get(),
            Err(Error::InComputed {
                operation: "reset_got_partial_results"
            })
        );
        assert!(reset_got_partial_results().is_ok());
    }

    #[test]
    fn scope_reports_errors() {
        let result = reactive_scope(|| Err(Error::msg("scope failed")));
        assert_eq!(result, Err(Error::msg("scope failed")));
    }

    #[test]
    fn continue_callback_controls_budget() {
        let polls = Rc::new(Cell::new(0));
        let outcome = Rc::new(Cell::new((false, false)));
        let inner = Computed::new(|| Ok(interrupted()));
        let partial = reactive_scope_with(
            {
                let outcome = outcome.clone();
                move || {
                    let first = interrupted();
                    let second = inner.get()?;
                    outcome.set((first, second));
                    Ok(())
                }
            },
            {
                let polls = polls.clone();
                move || {
                    polls.set(polls.get() + 1);
                    false
                }
            },
        )
        .unwrap();

        assert_eq!(outcome.get(), (false, true));
        assert!(polls.get() >= 1);
        assert!(partial);
        assert!(got_partial_results());
        reset_got_partial_results().unwrap();
        assert!(!interrupted());
    }

    #[test]
    fn scope_frees_what_it_read() {
        let source = ObservableValue::new(1);
        reactive_scope({
            let source = source.clone();
            move || {
                source.get();
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(source.reader_count(), 0);
    }
}
