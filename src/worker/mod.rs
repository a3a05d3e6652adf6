// src/worker/mod.rs
//! Workers: independently scheduled units with a compute phase, a render
//! phase and a private offscreen surface.
//!
//! User code implements [`Worker`]. The scheduler wraps each worker in a
//! [`WorkerHandle`], which owns the worker's surfaces, timing samples and
//! fault state, and is shared between the host thread and pool threads.

pub mod handle;

pub use handle::{WorkerFault, WorkerHandle};

use crate::context::HostContext;
use crate::surface::{PixelSurface, Surface};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// User-supplied periodic work.
///
/// Both phases run on a pool thread, never concurrently with each other for
/// the same worker. In decoupled mode `compute` runs on the host thread
/// inside `Scheduler::present` instead.
pub trait Worker<S: Surface = PixelSurface>: Send + 'static {
    /// Advances the worker's state. Runs before `render` in coupled mode.
    fn compute(&mut self, ctx: &HostContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Draws into the worker's private surface, which has already been
    /// cleared and opened for drawing.
    fn render(&mut self, surface: &mut S, ctx: &HostContext) -> anyhow::Result<()>;
}

/// Render-only worker built from a closure.
pub struct FnWorker<F>(pub F);

impl<S, F> Worker<S> for FnWorker<F>
where
    S: Surface,
    F: FnMut(&mut S, &HostContext) -> anyhow::Result<()> + Send + 'static,
{
    fn render(&mut self, surface: &mut S, ctx: &HostContext) -> anyhow::Result<()> {
        (self.0)(surface, ctx)
    }
}

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a worker, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) fn next() -> Self {
        WorkerId(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        WorkerId(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    /// Created but never registered with a scheduler.
    Idle = 0,
    Running = 1,
    Paused = 2,
    /// User code failed; the timer was cancelled. Resumable like `Paused`.
    Faulted = 3,
    /// Removed from its scheduler. Terminal.
    Stopped = 4,
}

impl WorkerState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => WorkerState::Running,
            2 => WorkerState::Paused,
            3 => WorkerState::Faulted,
            4 => WorkerState::Stopped,
            _ => WorkerState::Idle,
        }
    }
}

/// Which parts of a worker a tick runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickMode {
    /// compute then render
    Full,
    /// render only; compute is driven by `present`
    RenderOnly,
}

#[cfg(test)]
mod tests;
