//! Host Boundary
//!
//! A host is whatever renders on top of the engine (a UI tree, a terminal
//! view, a test harness). The engine never calls into rendering directly.
//! Instead:
//!
//! - Each rendering unit owns a [`HostContext`]. Reads made inside
//!   [`HostContext::track`] are recorded against it.
//! - When a recorded source changes, the engine calls [`Host::invalidate`]
//!   with that context. The host decides when to re-render.
//! - When derivations are queued for the next frame, the engine calls
//!   [`Host::invalidate_root`] so the host schedules a frame.
//! - The host calls the engine back through [`FrameHooks`]: once per frame
//!   before anything renders, and before each context renders.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::error::Result;
use crate::graph::{Edges, NodeId, Reader, Source};

use super::context::ReactiveContext;

/// Callbacks the engine makes into the host.
pub trait Host {
    /// A source read by `ctx` changed.
    fn invalidate(&self, ctx: &HostContext);

    /// Work was queued for the next frame.
    fn invalidate_root(&self) {}
}

/// Why a host context is about to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPhase {
    Create,
    Update,
    LocalUpdate,
    Destroy,
}

pub(crate) struct HostContextInner {
    id: NodeId,
    using: RefCell<Edges<Source>>,
    invalidated: Cell<bool>,
}

impl HostContextInner {
    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn mark_using(&self, source: NodeId, make: impl FnOnce() -> Source) -> bool {
        let mut using = self.using.borrow_mut();
        if using.contains_key(&source) {
            return false;
        }
        using.insert(source, make());
        true
    }

    /// Drop the edge to a source that already removed us from its readers.
    pub(crate) fn forget(&self, source: NodeId) {
        self.using.borrow_mut().shift_remove(&source);
    }

    pub(crate) fn mark_invalidated(&self) {
        self.invalidated.set(true);
    }

    /// Release every edge before a re-render.
    pub(crate) fn release(&self) {
        let using = std::mem::take(&mut *self.using.borrow_mut());
        for source in using.values() {
            source.unmark(self.id);
        }
        self.invalidated.set(false);
    }
}

impl Drop for HostContextInner {
    fn drop(&mut self) {
        let using = std::mem::take(self.using.get_mut());
        for source in using.values() {
            source.unmark(self.id);
        }
    }
}

/// The reader state of one rendering unit.
#[derive(Clone)]
pub struct HostContext {
    inner: Rc<HostContextInner>,
}

impl HostContext {
    /// A context with no reads recorded.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(HostContextInner {
                id: NodeId::new(),
                using: RefCell::new(Edges::new()),
                invalidated: Cell::new(false),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<HostContextInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn reader(&self) -> Reader {
        Reader::Host(self.inner.clone())
    }

    pub(crate) fn inner(&self) -> &HostContextInner {
        &self.inner
    }

    /// The context's node id, as seen by [`Host::invalidate`].
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Run `f` with this context as the current reader.
    pub fn track<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = ReactiveContext::enter(self.reader());
        f()
    }

    /// Prepare for an update render, then run `f` tracked.
    pub fn render<R>(&self, f: impl FnOnce() -> R) -> R {
        super::runtime::Runtime::before_render(self, RenderPhase::Update);
        self.track(f)
    }

    /// Whether a source read by this context changed since it last rendered.
    pub fn is_invalidated(&self) -> bool {
        self.inner.invalidated.get()
    }

    /// Number of sources read by the last render.
    pub fn dependency_count(&self) -> usize {
        self.inner.using.borrow().len()
    }

    /// Whether both handles refer to the same context.
    pub fn ptr_eq(&self, other: &HostContext) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for HostContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext")
            .field("id", &self.inner.id)
            .field("dependencies", &self.dependency_count())
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}

pub type BeforeRender = Rc<dyn Fn(&HostContext, RenderPhase)>;
pub type ReallyBeforeFrame = Rc<dyn Fn() -> Result<()>>;

/// Hook slots a host exposes to libraries running on top of it.
///
/// Setting a hook returns the previous one so installers can chain to it.
#[derive(Clone, Default)]
pub struct FrameHooks {
    pub(crate) before_render: Option<BeforeRender>,
    pub(crate) really_before_frame: Option<ReallyBeforeFrame>,
}

impl FrameHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the per-context render hook, returning the previous one.
    pub fn set_before_render(&mut self, hook: BeforeRender) -> Option<BeforeRender> {
        self.before_render.replace(hook)
    }

    /// Install the per-frame hook, returning the previous one.
    pub fn set_really_before_frame(&mut self, hook: ReallyBeforeFrame) -> Option<ReallyBeforeFrame> {
        self.really_before_frame.replace(hook)
    }

    /// Called by the host before `ctx` renders.
    pub fn before_render(&self, ctx: &HostContext, phase: RenderPhase) {
        if let Some(hook) = &self.before_render {
            hook(ctx, phase);
        }
    }

    /// Called by the host once per frame, before any rendering.
    ///
    /// An error means the frame must not proceed.
    pub fn really_before_frame(&self) -> Result<()> {
        match &self.really_before_frame {
            Some(hook) => hook(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for FrameHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHooks")
            .field("before_render", &self.before_render.is_some())
            .field("really_before_frame", &self.really_before_frame.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::ObservableValue;

    #[test]
    fn track_records_reads() {
        let ctx = HostContext::new();
        let a = ObservableValue::new(1);
        let b = ObservableValue::new(2);

        let sum = ctx.track(|| a.get() + b.get() + a.get());
        assert_eq!(sum, 4);
        assert_eq!(ctx.dependency_count(), 2);
        assert_eq!(a.reader_count(), 1);
    }

    #[test]
    fn change_marks_context_invalidated() {
        let ctx = HostContext::new();
        let a = ObservableValue::new(1);
        ctx.track(|| a.get());

        a.set(2).unwrap();
        assert!(ctx.is_invalidated());
        assert_eq!(ctx.dependency_count(), 0);

        ctx.render(|| a.get());
        assert!(!ctx.is_invalidated());
        assert_eq!(ctx.dependency_count(), 1);
    }

    #[test]
    fn dropping_context_releases_edges() {
        let a = ObservableValue::new(1);
        {
            let ctx = HostContext::new();
            ctx.track(|| a.get());
            assert_eq!(a.reader_count(), 1);
        }
        assert_eq!(a.reader_count(), 0);
    }

    #[test]
    fn setting_hook_returns_previous() {
        let mut hooks = FrameHooks::new();
        assert!(hooks.set_really_before_frame(Rc::new(|| -> Result<()> { Ok(()) })).is_none());
        assert!(hooks.set_really_before_frame(Rc::new(|| -> Result<()> { Ok(()) })).is_some());
    }
}
