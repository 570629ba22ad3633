//! Frame Scheduler
//!
//! The scheduler owns every piece of per-thread engine state that is not
//! stored on a node: the pending-update queue, the set of derivations that may
//! have lost their last reader, zombie deadlines, the interruption budget and
//! the async wake queue.
//!
//! # How a Frame Works
//!
//! Once per frame the host calls [`before_frame`]:
//!
//! 1. The frame start time is recorded for the time budget.
//! 2. Unless the previous frame was interrupted, derivations that lost their
//!    last reader are buried (freed or turned into zombies).
//! 3. Zombies whose grace period elapsed are freed.
//! 4. Async computeds whose futures were woken are polled.
//! 5. The pending-update queue is drained. Updating one derivation may queue
//!    more work, so the queue is drained repeatedly, at most
//!    `max_iterations` times. Work left after that is reported as
//!    [`Error::DidNotStabilize`].
//!
//! The first write after a quiet period asks the host to schedule a frame
//! through [`Host::invalidate_root`](crate::reactive::Host::invalidate_root).

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Wake, Waker};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::reactive::async_computed::AsyncStep;
use crate::reactive::clock::{Clock, SystemClock};
use crate::reactive::derivation::{ComputedState, Derivation};
use crate::reactive::host::{Host, HostContext, HostContextInner};

use super::node::{Edges, NodeId};

thread_local! {
    static SCHEDULER: FrameScheduler = FrameScheduler::new();
}

/// Run `f` with this thread's scheduler.
pub(crate) fn with<R>(f: impl FnOnce(&FrameScheduler) -> R) -> R {
    SCHEDULER.with(f)
}

type WakeQueue = Arc<Mutex<VecDeque<(NodeId, u64)>>>;

struct Zombie {
    derivation: Weak<dyn Derivation>,
    counter: u64,
    deadline: Duration,
}

/// Interruption bookkeeping for the current frame.
pub(crate) struct Interruption {
    pub(crate) frame_start: Cell<Duration>,
    pub(crate) already_interrupted: Cell<bool>,
    pub(crate) outside_partial_results: Cell<bool>,
    /// Reader of the first `interrupted()` call since the last interruption.
    /// It is allowed to finish even over budget.
    pub(crate) first_interruptible: Cell<Option<NodeId>>,
    pub(crate) budget_override: RefCell<Option<Rc<dyn Fn() -> bool>>>,
}

/// Saved interruption state, restored when a scope ends.
pub(crate) struct InterruptionSnapshot {
    already_interrupted: bool,
    first_interruptible: Option<NodeId>,
    budget_override: Option<Rc<dyn Fn() -> bool>>,
}

pub(crate) struct FrameScheduler {
    config: Cell<RuntimeConfig>,
    host: RefCell<Option<Rc<dyn Host>>>,
    clock: RefCell<Rc<dyn Clock>>,
    pub(crate) interruption: Interruption,
    update_next_frame: RefCell<Vec<Rc<dyn Derivation>>>,
    bury_dead: RefCell<Edges<Weak<dyn Derivation>>>,
    zombies: RefCell<Vec<Zombie>>,
    wakes: WakeQueue,
    pending_async: RefCell<HashMap<NodeId, Weak<dyn AsyncStep>>>,
}

impl FrameScheduler {
    fn new() -> Self {
        let clock: Rc<dyn Clock> = Rc::new(SystemClock::new());
        let frame_start = clock.now();
        Self {
            config: Cell::new(RuntimeConfig::default()),
            host: RefCell::new(None),
            clock: RefCell::new(clock),
            interruption: Interruption {
                frame_start: Cell::new(frame_start),
                already_interrupted: Cell::new(false),
                outside_partial_results: Cell::new(false),
                first_interruptible: Cell::new(None),
                budget_override: RefCell::new(None),
            },
            update_next_frame: RefCell::new(Vec::new()),
            bury_dead: RefCell::new(Edges::new()),
            zombies: RefCell::new(Vec::new()),
            wakes: Arc::new(Mutex::new(VecDeque::new())),
            pending_async: RefCell::new(HashMap::new()),
        }
    }
}

// ---- Configuration ----

pub(crate) fn config() -> RuntimeConfig {
    with(|s| s.config.get())
}

pub(crate) fn set_config(config: RuntimeConfig) {
    with(|s| s.config.set(config));
}

pub(crate) fn host() -> Option<Rc<dyn Host>> {
    with(|s| s.host.borrow().clone())
}

pub(crate) fn set_host(host: Option<Rc<dyn Host>>) {
    with(|s| *s.host.borrow_mut() = host);
}

pub(crate) fn now() -> Duration {
    let clock = with(|s| s.clock.borrow().clone());
    clock.now()
}

pub(crate) fn set_clock(clock: Rc<dyn Clock>) {
    let start = clock.now();
    with(|s| {
        *s.clock.borrow_mut() = clock;
        s.interruption.frame_start.set(start);
    });
}

// ---- Host notification ----

/// Queue `derivation` for the next frame, asking the host for a frame if the
/// queue was empty.
pub(crate) fn schedule_update(derivation: Rc<dyn Derivation>) {
    let first = with(|s| {
        let mut queue = s.update_next_frame.borrow_mut();
        let first = queue.is_empty();
        queue.push(derivation);
        first
    });
    if first {
        if let Some(host) = host() {
            host.invalidate_root();
        }
    }
}

pub(crate) fn pending_updates() -> usize {
    with(|s| s.update_next_frame.borrow().len())
}

pub(crate) fn invalidate_host(ctx: &Rc<HostContextInner>) {
    ctx.mark_invalidated();
    trace!(context = ctx.id().raw(), "host context invalidated");
    if let Some(host) = host() {
        host.invalidate(&HostContext::from_inner(ctx.clone()));
    }
}

// ---- Burial ----

/// Remember that `derivation` may have lost its last reader.
///
/// Also reached from `Drop` impls, so it tolerates the thread-local being gone.
pub(crate) fn bury_later(derivation: &Rc<dyn Derivation>) {
    let _ = SCHEDULER.try_with(|s| {
        s.bury_dead
            .borrow_mut()
            .insert(derivation.id(), Rc::downgrade(derivation));
    });
}

pub(crate) fn forget_dead(id: NodeId) {
    let _ = SCHEDULER.try_with(|s| {
        s.bury_dead.borrow_mut().shift_remove(&id);
    });
}

pub(crate) fn pending_burials() -> usize {
    with(|s| s.bury_dead.borrow().len())
}

/// Replace the pending-burial set, returning the previous one.
pub(crate) fn swap_dead_set(set: Edges<Weak<dyn Derivation>>) -> Edges<Weak<dyn Derivation>> {
    with(|s| std::mem::replace(&mut *s.bury_dead.borrow_mut(), set))
}

/// Bury every derivation in the pending set that still has no reader.
pub(crate) fn bury_dead_set() {
    loop {
        let dead = swap_dead_set(Edges::new());
        if dead.is_empty() {
            return;
        }
        debug!(count = dead.len(), "burying unused derivations");
        for derivation in dead.values().filter_map(Weak::upgrade) {
            derivation.bury_if_dead();
        }
    }
}

pub(crate) fn schedule_zombie(derivation: &Rc<dyn Derivation>, counter: u64, delay: Duration) {
    let deadline = now() + delay;
    with(|s| {
        s.zombies.borrow_mut().push(Zombie {
            derivation: Rc::downgrade(derivation),
            counter,
            deadline,
        });
    });
}

/// Free zombies whose grace period elapsed without being read again.
pub(crate) fn sweep_zombies() {
    let now = now();
    let due: Vec<Zombie> = with(|s| {
        let mut zombies = s.zombies.borrow_mut();
        let (due, alive): (Vec<Zombie>, Vec<Zombie>) =
            zombies.drain(..).partition(|z| z.deadline <= now);
        *zombies = alive;
        due
    });
    for zombie in due {
        let Some(derivation) = zombie.derivation.upgrade() else {
            continue;
        };
        let core = derivation.core();
        if core.state() == ComputedState::Zombie && core.zombie_counter() == zombie.counter {
            debug!(node = core.id().raw(), "freeing zombie");
            core.set_state(ComputedState::First);
            derivation.free();
        }
    }
}

// ---- Interruption ----

pub(crate) fn save_interruption() -> InterruptionSnapshot {
    with(|s| InterruptionSnapshot {
        already_interrupted: s.interruption.already_interrupted.get(),
        first_interruptible: s.interruption.first_interruptible.get(),
        budget_override: s.interruption.budget_override.borrow().clone(),
    })
}

pub(crate) fn restore_interruption(snapshot: InterruptionSnapshot) {
    with(|s| {
        s.interruption
            .already_interrupted
            .set(snapshot.already_interrupted);
        s.interruption
            .first_interruptible
            .set(snapshot.first_interruptible);
        *s.interruption.budget_override.borrow_mut() = snapshot.budget_override;
    });
}

fn reset_interruption() {
    with(|s| {
        s.interruption.already_interrupted.set(false);
        s.interruption.outside_partial_results.set(false);
        s.interruption.first_interruptible.set(None);
    });
}

/// Whether evaluation may continue in this frame.
pub(crate) fn have_time_budget() -> bool {
    let over = with(|s| s.interruption.budget_override.borrow().clone());
    if let Some(over) = over {
        return over();
    }
    let start = with(|s| s.interruption.frame_start.get());
    now().saturating_sub(start) < config().time_budget
}

// ---- Async wakeups ----

struct AsyncWake {
    queue: WakeQueue,
    id: NodeId,
    generation: u64,
}

impl Wake for AsyncWake {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.queue.lock().push_back((self.id, self.generation));
    }
}

/// A waker that queues a resume of the given async computed run.
pub(crate) fn waker_for(id: NodeId, generation: u64) -> Waker {
    let queue = with(|s| s.wakes.clone());
    Waker::from(Arc::new(AsyncWake {
        queue,
        id,
        generation,
    }))
}

pub(crate) fn register_async(id: NodeId, step: Weak<dyn AsyncStep>) {
    with(|s| {
        s.pending_async.borrow_mut().insert(id, step);
    });
}

pub(crate) fn unregister_async(id: NodeId) {
    let _ = SCHEDULER.try_with(|s| {
        s.pending_async.borrow_mut().remove(&id);
    });
}

/// Resume every async computed whose future was woken.
///
/// Returns how many runs were resumed.
pub(crate) fn poll_async() -> Result<usize> {
    let queue = with(|s| s.wakes.clone());
    let mut resumed = 0;
    let mut result = Ok(());
    for _ in 0..config().max_iterations {
        let batch: Vec<(NodeId, u64)> = queue.lock().drain(..).collect();
        if batch.is_empty() {
            break;
        }
        for (id, generation) in batch {
            let step = with(|s| s.pending_async.borrow().get(&id).and_then(Weak::upgrade));
            let Some(step) = step else {
                continue;
            };
            debug!(node = id.raw(), generation, "resuming async computed");
            resumed += 1;
            if let Err(err) = step.resume(generation) {
                result = Err(err);
            }
        }
    }
    result.map(|_| resumed)
}

// ---- Frame ----

/// Start a frame: bury, sweep, resume async work and drain pending updates.
pub(crate) fn before_frame() -> Result<()> {
    let start = now();
    with(|s| s.interruption.frame_start.set(start));
    if !with(|s| s.interruption.already_interrupted.get()) {
        bury_dead_set();
    }
    sweep_zombies();
    reset_interruption();
    let polled = poll_async();
    let drained = drain_updates();
    polled.and(drained)
}

/// Update every queued derivation. A failed update does not stop the rest;
/// the last failure is returned.
fn drain_updates() -> Result<()> {
    let max = config().max_iterations;
    let mut result = Ok(());
    for pass in 0..max {
        let batch = with(|s| std::mem::take(&mut *s.update_next_frame.borrow_mut()));
        if batch.is_empty() {
            return result;
        }
        trace!(pass, count = batch.len(), "draining scheduled updates");
        for derivation in batch {
            if let Err(err) = derivation.update_if_needed_without_resurrecting() {
                debug!(derivation = derivation.id().raw(), error = %err, "scheduled update failed");
                result = Err(err);
            }
        }
    }
    let remaining = pending_updates();
    if remaining == 0 {
        return result;
    }
    error!(iterations = max, remaining, "computed values did not stabilize");
    Err(Error::DidNotStabilize { iterations: max })
}
