//! Reactive Runtime
//!
//! The runtime is the entry point a host uses to drive the engine. All state
//! is per thread; `Runtime` itself is a namespace.
//!
//! # How It Works
//!
//! 1. The host registers itself with [`Runtime::set_host`] so the engine can
//!    ask for frames and report invalidated contexts.
//! 2. Once per frame, before rendering, the host calls
//!    [`Runtime::before_frame`]. Dead derivations are buried, woken async
//!    runs resume and queued derivations are brought up to date.
//! 3. Before each context renders, the host calls [`Runtime::before_render`]
//!    so the context's old reads are forgotten.
//!
//! Hosts that expose [`FrameHooks`] can have the runtime wire itself in with
//! [`Runtime::install`].

use std::rc::Rc;

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::graph::{scheduler, NodeId};

use super::clock::Clock;
use super::context::{self, ReactiveContext};
use super::host::{FrameHooks, Host, HostContext, RenderPhase};

/// Per-thread engine controls.
pub struct Runtime;

impl Runtime {
    /// Register the host that receives invalidations.
    pub fn set_host(host: Rc<dyn Host>) {
        scheduler::set_host(Some(host));
    }

    /// Stop sending invalidations to the host.
    pub fn clear_host() {
        scheduler::set_host(None);
    }

    /// Replace the clock used for time budgets and zombie deadlines.
    pub fn set_clock(clock: Rc<dyn Clock>) {
        scheduler::set_clock(clock);
    }

    /// Replace the engine settings for this thread.
    pub fn configure(config: RuntimeConfig) {
        scheduler::set_config(config);
    }

    /// The engine settings in effect on this thread.
    pub fn config() -> RuntimeConfig {
        scheduler::config()
    }

    /// Start a frame.
    ///
    /// Fails with [`Error::DidNotStabilize`](crate::Error::DidNotStabilize)
    /// if queued derivations keep requeueing each other, or with the last
    /// error raised while updating them.
    pub fn before_frame() -> Result<()> {
        scheduler::before_frame()
    }

    /// Prepare `ctx` for rendering.
    ///
    /// Updates forget the context's previous reads and clear the
    /// partial-results flag so the render starts from a clean slate.
    pub fn before_render(ctx: &HostContext, phase: RenderPhase) {
        match phase {
            RenderPhase::Create => {}
            RenderPhase::Update | RenderPhase::LocalUpdate | RenderPhase::Destroy => {
                scheduler::with(|s| s.interruption.outside_partial_results.set(false));
                ctx.inner().release();
            }
        }
    }

    /// Resume async computeds whose futures were woken. Returns how many
    /// runs were resumed.
    pub fn poll_async() -> Result<usize> {
        scheduler::poll_async()
    }

    /// The reader currently recording reads, if any.
    pub fn current_reader() -> Option<NodeId> {
        ReactiveContext::current_id()
    }

    /// Whether a reader is currently recording reads.
    pub fn is_tracking() -> bool {
        ReactiveContext::is_active()
    }

    /// Run `f` without recording reads.
    pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
        context::untracked(f)
    }

    /// Derivations queued for the next frame.
    pub fn pending_updates() -> usize {
        scheduler::pending_updates()
    }

    /// Derivations that may have lost their last reader.
    pub fn pending_burials() -> usize {
        scheduler::pending_burials()
    }

    /// Wire the runtime into a host's hook slots.
    ///
    /// Hooks already installed keep running, after ours. A failed frame
    /// update is returned without running them.
    pub fn install(hooks: &mut FrameHooks) {
        let previous_frame = hooks.really_before_frame.take();
        hooks.set_really_before_frame(Rc::new(move || -> Result<()> {
            Runtime::before_frame()?;
            match &previous_frame {
                Some(previous) => previous(),
                None => Ok(()),
            }
        }));

        let previous_render = hooks.before_render.take();
        hooks.set_before_render(Rc::new(move |ctx, phase| {
            Runtime::before_render(ctx, phase);
            if let Some(previous) = &previous_render {
                previous(ctx, phase);
            }
        }));
    }
}
