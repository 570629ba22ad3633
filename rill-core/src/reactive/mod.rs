//! Reactive Primitives
//!
//! This module implements the reactive engine: atoms, derivations and the
//! machinery that keeps them consistent across frames.
//!
//! # Concepts
//!
//! ## Atoms
//!
//! An atom is the smallest observable unit. Reading it inside a reader records
//! an edge; writing a different value notifies every reader and forgets them.
//! [`ObservableValue`] pairs an atom with a value and an enhancer.
//!
//! ## Computeds
//!
//! A [`Computed`] caches a derived value. Dependencies are re-recorded on
//! every evaluation, so a computed only ever depends on what its last run
//! actually read. Computeds nobody reads are freed (see the burial rules in
//! [`crate::graph`]).
//!
//! ## Reactions
//!
//! A [`Reaction`] runs side effects when its tracked expression changes.
//! Reactions are queued and run during [`Runtime::before_frame`].
//!
//! ## Async Computeds
//!
//! An [`AsyncComputed`] derives a value from a future and exposes whether it
//! is still busy.
//!
//! ## Interruption
//!
//! Work can be split over several frames with [`interrupted`] and the
//! partial-results flags.
//!
//! # Implementation Notes
//!
//! The engine is single-threaded. A thread-local context stack records who is
//! reading, and per-thread scheduler state lives in [`crate::graph`].

pub(crate) mod async_computed;
pub(crate) mod atom;
pub mod clock;
mod computed;
pub(crate) mod context;
pub(crate) mod derivation;
pub(crate) mod host;
mod interrupt;
mod parametric;
mod reaction;
mod runtime;

pub use async_computed::{AsyncComputed, AsyncContext, AsyncResult};
pub use atom::{ObservableValue, Prop};
pub use clock::{Clock, ManualClock, SystemClock};
pub use computed::{debug_run_when_invalidated, Comparator, Computed, ComputedOptions};
pub use context::untracked;
pub use derivation::ComputedState;
pub use host::{BeforeRender, FrameHooks, Host, HostContext, ReallyBeforeFrame, RenderPhase};
pub use interrupt::{
    computed_scope, computed_scope_with, got_partial_results, interrupted, reactive_scope,
    reactive_scope_with, reset_got_partial_results, set_time_budget, time_budget,
};
pub use parametric::{
    create_transformer, create_transformer_with_free, ParametricAsyncComputedMap,
    ParametricComputedMap, Transformer,
};
pub use reaction::{autorun, reaction, reaction_with_comparator, when, Disposer, Reaction};
pub use runtime::Runtime;

pub(crate) use computed::{ComputedImpl, FreeAction};
