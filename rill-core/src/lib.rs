//! Rill Core
//!
//! This crate provides a fine-grained reactive state-tracking engine.
//! It implements:
//!
//! - Atoms: observable value cells that record who read them
//! - Observable containers (arrays, maps, records, class fields)
//! - Enhancers controlling how written values are wrapped and compared
//! - Derivations: memoized computeds, reactions and async computeds
//! - A frame scheduler with time-budgeted, interruptible evaluation
//!
//! The engine is single-threaded. Rendering is left to a host, which talks to
//! the core through [`reactive::HostContext`], the [`reactive::Host`] trait and
//! [`reactive::FrameHooks`].
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: atoms, derivations, interruption and the host boundary
//! - `graph`: usage edges between sources and readers, and the frame scheduler
//! - `observable`: enhancers, dynamic values and observable containers
//!
//! # Example
//!
//! ```rust
//! use rill_core::reactive::{Computed, ObservableValue};
//!
//! let x = ObservableValue::new(1);
//! let y = ObservableValue::new(2);
//!
//! let sum = Computed::new({
//!     let (x, y) = (x.clone(), y.clone());
//!     move || Ok(x.get() + y.get())
//! });
//!
//! assert_eq!(sum.get().unwrap(), 3);
//! x.set(10).unwrap();
//! assert_eq!(sum.get().unwrap(), 12);
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod observable;
pub mod reactive;

pub use config::RuntimeConfig;
pub use error::{CaughtException, Error, Result};
pub use graph::NodeId;
pub use observable::{
    deep_equal, Enhance, Enhancer, ObservableArray, ObservableMap, ObservableObject, SameValue,
    Value,
};
pub use reactive::{
    autorun, interrupted, reaction, reactive_scope, when, AsyncComputed, Computed,
    ObservableValue, Prop, Runtime,
};
