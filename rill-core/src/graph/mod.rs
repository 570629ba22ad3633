//! Dependency Graph
//!
//! This module holds the usage edges between sources and the readers that
//! depend on them, plus the per-thread frame scheduler.
//!
//! # Overview
//!
//! Every source (an atom or a derivation) keeps a set of weak back-references
//! to its readers. Every reader (a derivation or a host context) keeps a set of
//! strong references to the sources it read during its last evaluation.
//!
//! - Edges are recorded lazily, the first time a reader touches a source
//!   during an evaluation.
//! - Before a derivation re-evaluates, its edges are cleared, so the set of
//!   edges always reflects exactly what the latest evaluation read.
//! - Readers own their sources, sources never own their readers. Dropping the
//!   last handle to a reader releases the whole upstream chain.
//!
//! # Scheduling
//!
//! Nothing is evaluated eagerly on write. Derivations watched by a host, and
//! reactions, are queued and drained once per frame by the scheduler (see
//! [`Runtime::before_frame`](crate::reactive::Runtime::before_frame)).

mod node;
pub(crate) mod scheduler;

pub use node::NodeId;
pub(crate) use node::{notify_readers, track, Edges, Reader, Source, WeakReader};
