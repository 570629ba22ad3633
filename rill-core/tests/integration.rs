//! Integration Tests for the Reactive Engine
//!
//! These tests drive the engine the way a host would: contexts read state,
//! frames start through the runtime, and invalidations arrive through the
//! `Host` trait.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use rill_core::observable::{
    Behind, ClassId, ComputedMethod, Field, ObservableArray, ObservableClass, ObservableMap,
    ObservableObject, Value,
};
use rill_core::reactive::{
    autorun, interrupted, reaction, AsyncComputed, AsyncContext, Computed, ComputedOptions,
    ComputedState, FrameHooks, Host, HostContext, ManualClock, ObservableValue, RenderPhase,
    Runtime,
};
use rill_core::{Error, NodeId, RuntimeConfig};
use serde_json::json;
use tokio::sync::oneshot;

/// Host that records what the engine asked of it.
#[derive(Default)]
struct TestHost {
    frames_requested: Cell<usize>,
    invalidated: RefCell<Vec<NodeId>>,
}

impl Host for TestHost {
    fn invalidate(&self, ctx: &HostContext) {
        self.invalidated.borrow_mut().push(ctx.id());
    }

    fn invalidate_root(&self) {
        self.frames_requested.set(self.frames_requested.get() + 1);
    }
}

fn install_host() -> Rc<TestHost> {
    let host = Rc::new(TestHost::default());
    Runtime::set_host(host.clone());
    host
}

fn counter() -> Rc<Cell<usize>> {
    Rc::new(Cell::new(0))
}

// ---- Propagation ----

/// A diamond re-evaluates each node once per change.
#[test]
fn diamond_evaluates_each_node_once() {
    let source = ObservableValue::new(1);
    let (left_runs, right_runs, bottom_runs) = (counter(), counter(), counter());

    let left = Computed::new({
        let (source, runs) = (source.clone(), left_runs.clone());
        move || {
            runs.set(runs.get() + 1);
            Ok(source.get() + 1)
        }
    });
    let right = Computed::new({
        let (source, runs) = (source.clone(), right_runs.clone());
        move || {
            runs.set(runs.get() + 1);
            Ok(source.get() * 2)
        }
    });
    let bottom = Computed::new({
        let (left, right, runs) = (left.clone(), right.clone(), bottom_runs.clone());
        move || {
            runs.set(runs.get() + 1);
            Ok(left.get()? + right.get()?)
        }
    });

    let ctx = HostContext::new();
    assert_eq!(ctx.track(|| bottom.get()).unwrap(), 4);

    source.set(5).unwrap();
    assert!(!ctx.is_invalidated());
    Runtime::before_frame().unwrap();
    assert!(ctx.is_invalidated());
    Runtime::before_render(&ctx, RenderPhase::Update);
    assert_eq!(ctx.track(|| bottom.get()).unwrap(), 16);

    assert_eq!(left_runs.get(), 2);
    assert_eq!(right_runs.get(), 2);
    assert_eq!(bottom_runs.get(), 2);
}

/// A computed whose value did not change stops the wave.
#[test]
fn unchanged_intermediate_stops_propagation() {
    let host = install_host();
    let source = ObservableValue::new(1);
    let downstream_runs = counter();

    let parity = Computed::new({
        let source = source.clone();
        move || Ok(source.get() % 2)
    });
    let label = Computed::new({
        let (parity, runs) = (parity.clone(), downstream_runs.clone());
        move || {
            runs.set(runs.get() + 1);
            Ok(if parity.get()? == 1 { "odd" } else { "even" })
        }
    });

    let ctx = HostContext::new();
    assert_eq!(ctx.track(|| label.get()).unwrap(), "odd");

    source.set(3).unwrap();
    assert_eq!(label.state(), ComputedState::NeedDepsRecheck);
    assert_eq!(Runtime::pending_updates(), 1);
    assert_eq!(host.frames_requested.get(), 1);

    Runtime::before_frame().unwrap();
    assert_eq!(downstream_runs.get(), 1);
    assert!(host.invalidated.borrow().is_empty());
    assert!(!ctx.is_invalidated());

    source.set(4).unwrap();
    Runtime::before_frame().unwrap();
    assert_eq!(downstream_runs.get(), 2);
    assert_eq!(*host.invalidated.borrow(), vec![ctx.id()]);
}

/// Errors are cached like values, and the same error again is no change.
#[test]
fn errors_are_cached_results() {
    let source = ObservableValue::new(-1);
    let runs = counter();
    let checked = Computed::new({
        let (source, runs) = (source.clone(), runs.clone());
        move || {
            runs.set(runs.get() + 1);
            match source.get() {
                n if n < 0 => Err(Error::msg("negative")),
                n => Ok(n),
            }
        }
    });

    let ctx = HostContext::new();
    assert_eq!(ctx.track(|| checked.get()), Err(Error::msg("negative")));
    assert_eq!(ctx.track(|| checked.get()), Err(Error::msg("negative")));
    assert_eq!(runs.get(), 1);

    source.set(2).unwrap();
    assert_eq!(ctx.track(|| checked.get()), Ok(2));
}

/// Writing an input of the computed being evaluated is refused.
#[test]
fn writes_during_evaluation_are_refused() {
    let source = ObservableValue::new(1);
    let sneaky = Computed::new({
        let source = source.clone();
        move || {
            let value = source.get();
            source.set(value + 1)?;
            Ok(value)
        }
    });

    assert_eq!(sneaky.get(), Err(Error::ModifiedDuringUpdate));
    assert_eq!(source.get_untracked(), 1);
}

/// A computed reading itself fails instead of looping.
#[test]
fn recursive_computed_is_detected() {
    let slot: Rc<RefCell<Option<Computed<i32>>>> = Rc::default();
    let selfish = Computed::new({
        let slot = slot.clone();
        move || match slot.borrow().as_ref() {
            Some(me) => me.get(),
            None => Ok(0),
        }
    });
    *slot.borrow_mut() = Some(selfish.clone());

    assert_eq!(selfish.get(), Err(Error::RecursiveComputed));
    slot.borrow_mut().take();
}

// ---- Frames ----

/// Work that runs out of budget finishes in a later frame.
#[test]
fn interrupted_work_finishes_next_frame() {
    let host = install_host();
    let clock = Rc::new(ManualClock::new());
    Runtime::set_clock(clock.clone());
    Runtime::configure(RuntimeConfig::default().with_time_budget(Duration::from_millis(10)));

    let slow = Computed::new({
        let clock = clock.clone();
        move || {
            clock.advance(Duration::from_millis(20));
            Ok(if interrupted() { -1 } else { 1 })
        }
    });
    let late_runs = counter();
    let late = Computed::new({
        let runs = late_runs.clone();
        move || {
            runs.set(runs.get() + 1);
            Ok(if interrupted() { 0 } else { 2 })
        }
    });

    let ctx = HostContext::new();
    let render = || ctx.track(|| Ok::<_, Error>((slow.get()?, late.get()?)));

    Runtime::before_frame().unwrap();
    assert_eq!(render().unwrap(), (1, 0));
    assert!(late.has_partial_results());
    assert!(ctx.is_invalidated());
    assert_eq!(*host.invalidated.borrow(), vec![ctx.id()]);

    Runtime::before_frame().unwrap();
    Runtime::before_render(&ctx, RenderPhase::Update);
    assert_eq!(render().unwrap(), (1, 2));
    assert!(!late.has_partial_results());
    assert_eq!(late_runs.get(), 2);
}

/// Unread computeds with a grace period linger, then get freed.
#[test]
fn zombies_are_freed_after_grace_period() {
    let clock = Rc::new(ManualClock::new());
    Runtime::set_clock(clock.clone());

    let source = ObservableValue::new(3);
    let runs = counter();
    let squared = Computed::with_options(
        {
            let (source, runs) = (source.clone(), runs.clone());
            move || {
                runs.set(runs.get() + 1);
                Ok(source.get() * source.get())
            }
        },
        ComputedOptions::new().zombie_time(Duration::from_millis(100)),
    );

    let ctx = HostContext::new();
    assert_eq!(ctx.track(|| squared.get()).unwrap(), 9);

    Runtime::before_render(&ctx, RenderPhase::Destroy);
    Runtime::before_frame().unwrap();
    assert_eq!(squared.state(), ComputedState::Zombie);
    assert_eq!(source.reader_count(), 1);

    clock.advance(Duration::from_millis(50));
    assert_eq!(ctx.track(|| squared.get()).unwrap(), 9);
    assert_eq!(runs.get(), 1);

    Runtime::before_render(&ctx, RenderPhase::Destroy);
    Runtime::before_frame().unwrap();
    clock.advance(Duration::from_millis(150));
    Runtime::before_frame().unwrap();
    assert_eq!(squared.state(), ComputedState::First);
    assert_eq!(source.reader_count(), 0);

    assert_eq!(squared.get().unwrap(), 9);
    assert_eq!(runs.get(), 2);
}

/// Reactions that keep re-triggering each other are cut off.
#[test]
fn oscillating_reaction_does_not_stabilize() {
    Runtime::configure(RuntimeConfig::default().with_max_iterations(5));
    let source = ObservableValue::new(0);
    let handle = reaction(
        {
            let source = source.clone();
            move |_| Ok(source.get())
        },
        {
            let source = source.clone();
            move |value, _| {
                let _ = source.set(value + 1);
            }
        },
    );

    assert_eq!(
        Runtime::before_frame(),
        Err(Error::DidNotStabilize { iterations: 5 })
    );
    assert_eq!(source.get_untracked(), 5);
    handle.dispose();
}

/// Installed hooks run the frame before the host's own hook.
#[test]
fn installed_hooks_drive_reactions() {
    let order = Rc::new(RefCell::new(Vec::new()));
    let mut hooks = FrameHooks::new();
    hooks.set_really_before_frame(Rc::new({
        let order = order.clone();
        move || -> rill_core::Result<()> {
            order.borrow_mut().push("host");
            Ok(())
        }
    }));
    Runtime::install(&mut hooks);

    let source = ObservableValue::new(1);
    let _handle = autorun({
        let (source, order) = (source.clone(), order.clone());
        move |_| {
            source.get();
            order.borrow_mut().push("reaction");
            Ok(())
        }
    });

    hooks.really_before_frame().unwrap();
    assert_eq!(*order.borrow(), vec!["reaction", "host"]);

    source.set(2).unwrap();
    hooks.really_before_frame().unwrap();
    assert_eq!(*order.borrow(), vec!["reaction", "host", "reaction", "host"]);

    let ctx = HostContext::new();
    ctx.track(|| source.get());
    assert_eq!(ctx.dependency_count(), 1);
    hooks.before_render(&ctx, RenderPhase::Update);
    assert_eq!(ctx.dependency_count(), 0);
}

/// A frame that does not stabilize fails through the installed hook and
/// stops before the host's own hook.
#[test]
fn installed_hook_reports_unstable_frame() {
    Runtime::configure(RuntimeConfig::default().with_max_iterations(5));
    let host_frames = Rc::new(Cell::new(0));
    let mut hooks = FrameHooks::new();
    hooks.set_really_before_frame(Rc::new({
        let host_frames = host_frames.clone();
        move || -> rill_core::Result<()> {
            host_frames.set(host_frames.get() + 1);
            Ok(())
        }
    }));
    Runtime::install(&mut hooks);

    let source = ObservableValue::new(0);
    let handle = reaction(
        {
            let source = source.clone();
            move |_| Ok(source.get())
        },
        {
            let source = source.clone();
            move |value, _| {
                let _ = source.set(value + 1);
            }
        },
    );

    assert_eq!(
        hooks.really_before_frame(),
        Err(Error::DidNotStabilize { iterations: 5 })
    );
    assert_eq!(host_frames.get(), 0);
    assert_eq!(source.get_untracked(), 5);
    handle.dispose();
}

// ---- Async ----

/// A resolved future reaches the host that rendered the busy state.
#[test]
fn async_result_reaches_host() {
    let host = install_host();
    let source = ObservableValue::new(2);
    let gate = Rc::new(RefCell::new(None::<oneshot::Receiver<i32>>));

    let fetched = AsyncComputed::new({
        let (source, gate) = (source.clone(), gate.clone());
        move |cx: AsyncContext<i32>| {
            let base = source.get();
            let rx = gate.borrow_mut().take();
            async move {
                cx.publish(base)?;
                let extra = match rx {
                    Some(rx) => rx.await.map_err(|_| Error::Cancelled)?,
                    None => 0,
                };
                Ok(base + extra)
            }
        }
    });

    let (tx, rx) = oneshot::channel();
    *gate.borrow_mut() = Some(rx);

    let ctx = HostContext::new();
    let render = || {
        ctx.track(|| {
            let run = fetched.run()?;
            Ok::<_, Error>((run.busy()?, run.result()?))
        })
    };

    assert_eq!(render().unwrap(), (true, Some(2)));
    assert!(host.invalidated.borrow().is_empty());

    tx.send(40).unwrap();
    Runtime::before_frame().unwrap();
    assert!(ctx.is_invalidated());

    Runtime::before_render(&ctx, RenderPhase::Update);
    assert_eq!(render().unwrap(), (false, Some(42)));
}

// ---- Containers ----

/// Map readers only hear about the keys and values they looked at.
#[test]
fn map_readers_are_key_granular() {
    let prices = ObservableMap::from_entries([("tea", 3), ("cake", 5)], Default::default()).unwrap();
    let by_tea = HostContext::new();
    let by_keys = HostContext::new();
    let by_missing = HostContext::new();

    by_tea.track(|| prices.get(&"tea"));
    by_keys.track(|| prices.keys());
    by_missing.track(|| prices.has(&"pie"));

    prices.set("cake", 6).unwrap();
    assert!(!by_tea.is_invalidated());
    assert!(!by_keys.is_invalidated());
    assert!(!by_missing.is_invalidated());

    prices.set("pie", 4).unwrap();
    assert!(!by_tea.is_invalidated());
    assert!(by_keys.is_invalidated());
    assert!(by_missing.is_invalidated());

    prices.set("tea", 2).unwrap();
    assert!(by_tea.is_invalidated());
}

/// A reaction over an observable array sees every structural change.
#[test]
fn array_reaction_tracks_structure() {
    let todos = ObservableArray::from(vec!["a".to_string(), "b".to_string()]);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let _handle = reaction(
        {
            let todos = todos.clone();
            move |_| Ok(todos.join(","))
        },
        {
            let seen = seen.clone();
            move |joined: &String, _| seen.borrow_mut().push(joined.clone())
        },
    );

    Runtime::before_frame().unwrap();
    todos.push("c".to_string()).unwrap();
    Runtime::before_frame().unwrap();
    todos.move_item(2, 0).unwrap();
    Runtime::before_frame().unwrap();
    todos.splice(1, Some(1), vec![]).unwrap();
    Runtime::before_frame().unwrap();

    assert_eq!(*seen.borrow(), vec!["a,b", "a,b,c", "c,a,b", "c,b"]);
}

/// Deep values become observable all the way down.
#[test]
fn deep_values_track_nested_writes() {
    let state = Value::from(json!({
        "user": {"name": "ann"},
        "todos": [{"title": "write", "done": false}],
    }))
    .wrap();
    let root = state.as_object().unwrap().clone();

    let done_count = Computed::new({
        let root = root.clone();
        move || {
            let todos = root.get("todos");
            let todos = todos.as_array().cloned().unwrap_or_default();
            Ok(todos.filter(|todo| {
                todo.as_object()
                    .and_then(|todo| todo.get("done").as_bool())
                    .unwrap_or(false)
            })
            .len())
        }
    });

    let ctx = HostContext::new();
    assert_eq!(ctx.track(|| done_count.get()).unwrap(), 0);

    let user = root.get("user");
    user.as_object().unwrap().set("name", Value::from("bob")).unwrap();
    assert!(!ctx.is_invalidated());

    let todos = root.get("todos");
    let first = todos.as_array().unwrap().get(0).unwrap();
    first.as_object().unwrap().set("done", Value::from(true)).unwrap();
    assert_eq!(ctx.track(|| done_count.get()).unwrap(), 1);

    todos
        .as_array()
        .unwrap()
        .push(Value::record([("title", Value::from("ship")), ("done", Value::from(true))]))
        .unwrap();
    assert_eq!(ctx.track(|| done_count.get()).unwrap(), 2);
}

/// Serializing observables gives the same JSON as the plain data.
#[test]
fn json_matches_plain_structure() {
    let plain = json!({
        "name": "board",
        "columns": [{"id": 1, "cards": ["x", "y"]}, {"id": 2, "cards": []}],
        "meta": {"ratio": 0.25, "archived": null},
    });
    let observed = Value::from(plain.clone()).wrap();
    assert_eq!(serde_json::to_value(&observed).unwrap(), plain);

    let object = observed.as_object().unwrap();
    object.set("name", Value::from("renamed")).unwrap();
    let mut expected = plain.clone();
    expected["name"] = json!("renamed");
    assert_eq!(observed.to_json(), expected);

    let numbers = ObservableArray::from(vec![1, 2, 3]);
    assert_eq!(serde_json::to_string(&numbers).unwrap(), "[1,2,3]");

    let object = ObservableObject::from_entries([("k", Value::from(1))], Default::default()).unwrap();
    assert_eq!(serde_json::to_string(&object).unwrap(), r#"{"k":1}"#);
}

// ---- Classes ----

static COUNTER: ClassId = ClassId::new("Counter");
static LABELLED: ClassId = ClassId::new("LabelledCounter");
static COUNT: Field<i64> = Field::new(&COUNTER, "count");
static LABEL: Field<String> = Field::new(&LABELLED, "label");
static DESCRIBE: ComputedMethod<String> = ComputedMethod::new(&COUNTER, "describe");
static DESCRIBE_LABELLED: ComputedMethod<String> = ComputedMethod::new(&LABELLED, "describe");

#[derive(Default)]
struct LabelledCounter {
    behind: Behind,
    describe_runs: Cell<usize>,
}

impl ObservableClass for LabelledCounter {
    fn behind(&self) -> &Behind {
        &self.behind
    }
}

fn describe(counter: &Rc<LabelledCounter>) -> rill_core::Result<String> {
    DESCRIBE.get(counter, |c| {
        c.describe_runs.set(c.describe_runs.get() + 1);
        Ok(format!("count={}", COUNT.get(&**c)))
    })
}

fn describe_labelled(counter: &Rc<LabelledCounter>) -> rill_core::Result<String> {
    DESCRIBE_LABELLED.get(counter, |c| Ok(format!("{}: {}", LABEL.get(&**c), describe(c)?)))
}

/// A subclass method builds on the superclass method of the same name.
#[test]
fn subclass_method_builds_on_superclass() {
    let counter = Rc::new(LabelledCounter::default());
    LABEL.set(&*counter, "clicks".to_string()).unwrap();

    let ctx = HostContext::new();
    assert_eq!(ctx.track(|| describe_labelled(&counter)).unwrap(), "clicks: count=0");

    LABEL.set(&*counter, "taps".to_string()).unwrap();
    Runtime::before_frame().unwrap();
    assert!(ctx.is_invalidated());
    Runtime::before_render(&ctx, RenderPhase::Update);
    assert_eq!(ctx.track(|| describe_labelled(&counter)).unwrap(), "taps: count=0");
    assert_eq!(counter.describe_runs.get(), 1);

    COUNT.set(&*counter, 3).unwrap();
    Runtime::before_render(&ctx, RenderPhase::Update);
    assert_eq!(ctx.track(|| describe_labelled(&counter)).unwrap(), "taps: count=3");
    assert_eq!(counter.describe_runs.get(), 2);
}
