//! Graph Nodes
//!
//! Node identities and the two ends of a usage edge.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use tracing::trace;

use crate::error::Result;
use crate::reactive::atom::AtomCore;
use crate::reactive::context::ReactiveContext;
use crate::reactive::derivation::Derivation;
use crate::reactive::host::HostContextInner;

use super::scheduler;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Insertion-ordered edge set keyed by the node at the other end.
pub(crate) type Edges<T> = IndexMap<NodeId, T>;

/// Something a reader can depend on. Held strongly by readers.
#[derive(Clone)]
pub(crate) enum Source {
    Atom(Rc<AtomCore>),
    Derivation(Rc<dyn Derivation>),
}

impl Source {
    pub(crate) fn id(&self) -> NodeId {
        match self {
            Source::Atom(atom) => atom.id(),
            Source::Derivation(derivation) => derivation.id(),
        }
    }

    /// Drop the back-reference from this source to `reader`.
    pub(crate) fn unmark(&self, reader: NodeId) {
        match self {
            Source::Atom(atom) => atom.remove_reader(reader),
            Source::Derivation(derivation) => derivation.unmark_used_by(reader),
        }
    }
}

/// Something that records the sources it reads.
#[derive(Clone)]
pub(crate) enum Reader {
    Derivation(Rc<dyn Derivation>),
    Host(Rc<HostContextInner>),
}

impl Reader {
    pub(crate) fn id(&self) -> NodeId {
        match self {
            Reader::Derivation(derivation) => derivation.id(),
            Reader::Host(host) => host.id(),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakReader {
        match self {
            Reader::Derivation(derivation) => WeakReader::Derivation(Rc::downgrade(derivation)),
            Reader::Host(host) => WeakReader::Host(Rc::downgrade(host)),
        }
    }

    /// Add `source` to this reader's usage set. Returns false when the edge
    /// already existed.
    pub(crate) fn mark_using(&self, source: NodeId, make: impl FnOnce() -> Source) -> bool {
        match self {
            Reader::Derivation(derivation) => derivation.core().mark_using(source, make),
            Reader::Host(host) => host.mark_using(source, make),
        }
    }
}

/// Back-reference from a source to one of its readers.
#[derive(Clone)]
pub(crate) enum WeakReader {
    Derivation(Weak<dyn Derivation>),
    Host(Weak<HostContextInner>),
}

impl WeakReader {
    pub(crate) fn upgrade(&self) -> Option<Reader> {
        match self {
            WeakReader::Derivation(derivation) => derivation.upgrade().map(Reader::Derivation),
            WeakReader::Host(host) => host.upgrade().map(Reader::Host),
        }
    }
}

/// Record a read of `source` by the active reader.
///
/// `readers` is the source's reverse index. Returns true when the read
/// happened outside of any reader.
pub(crate) fn track(
    source: NodeId,
    make: impl FnOnce() -> Source,
    readers: &RefCell<Edges<WeakReader>>,
) -> bool {
    let Some(reader) = ReactiveContext::current() else {
        return true;
    };
    if reader.mark_using(source, make) {
        trace!(source = source.raw(), reader = reader.id().raw(), "edge added");
        readers.borrow_mut().insert(reader.id(), reader.downgrade());
    }
    false
}

/// Tell every reader in `readers` that `source` changed.
///
/// All readers are notified even when one of them reports an error; the last
/// error is returned.
pub(crate) fn notify_readers(source: NodeId, readers: Edges<WeakReader>) -> Result<()> {
    let mut result = Ok(());
    for reader in readers.into_values() {
        match reader.upgrade() {
            Some(Reader::Derivation(derivation)) => {
                if let Err(err) = derivation.invalidate_by(source) {
                    result = Err(err);
                }
            }
            Some(Reader::Host(host)) => {
                host.forget(source);
                scheduler::invalidate_host(&host);
            }
            None => {}
        }
    }
    result
}
