// src/worker/handle.rs
//! Shared worker state and the per-tick execution path.
//!
//! Threading model:
//! - `core` (worker + back buffer) is locked for the whole tick, so ticks
//!   of one worker are serialized and `wait_idle` can join an in-flight tick
//! - `front` holds the last finished frame; a tick swaps its back buffer in
//!   when done, `present` only ever reads it
//! - decoupled compute never waits on `core`: if a tick holds it, the
//!   compute is owed and the tick runs it before rendering
//! - timing samples, tick count and state are atomics readable without locks

use crate::context::HostContext;
use crate::error::{Phase, SchedulerError};
use crate::surface::{PixelSurface, Surface};
use crate::worker::{TickMode, Worker, WorkerId, WorkerState};
use log::*;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

/// Last failure recorded for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFault {
    pub phase: Phase,
    pub message: String,
}

struct WorkerCore<S: Surface> {
    worker: Box<dyn Worker<S>>,
    back: S,
}

pub(crate) struct WorkerShared<S: Surface> {
    id: WorkerId,
    core: Mutex<WorkerCore<S>>,
    front: Mutex<S>,
    state: AtomicU8,
    timing: AtomicBool,
    compute_nanos: AtomicU64,
    render_nanos: AtomicU64,
    ticks: AtomicU64,
    /// decoupled computes deferred because a tick held `core`
    owed_computes: AtomicU64,
    fault: Mutex<Option<WorkerFault>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Runs user code, turning both `Err` and panics into a message.
fn run_guarded<F>(f: F) -> Result<(), String>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload))),
    }
}

impl<S: Surface> WorkerShared<S> {
    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn take_fault(&self) -> Option<WorkerFault> {
        lock(&self.fault).take()
    }

    /// Moves a running worker to `Faulted` and builds the report.
    ///
    /// Returns `None` if the worker was paused or stopped while the failing
    /// phase ran; that failure is only logged.
    fn record_fault(&self, phase: Phase, message: String) -> Option<SchedulerError> {
        let faulted = self.state.compare_exchange(
            WorkerState::Running as u8,
            WorkerState::Faulted as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if let Err(current) = faulted {
            debug!(
                "Worker {}: {} failed while {:?}, not reported: {}",
                self.id,
                phase,
                WorkerState::from_u8(current),
                message
            );
            return None;
        }
        debug!("Worker {}: {} failed: {}", self.id, phase, message);
        *lock(&self.fault) = Some(WorkerFault {
            phase,
            message: message.clone(),
        });
        Some(SchedulerError::UserCodeFailure {
            worker: self.id,
            phase,
            message,
        })
    }

    /// `superseded` is set when the failing tick's timer was cancelled
    /// while it ran (pause, stop or a relink); such failures are not reported.
    fn fail(&self, phase: Phase, message: String, superseded: bool) -> Result<bool, SchedulerError> {
        if superseded {
            debug!(
                "Worker {}: {} failed after its timer was cancelled: {}",
                self.id, phase, message
            );
            return Ok(false);
        }
        match self.record_fault(phase, message) {
            Some(err) => Err(err),
            None => Ok(false),
        }
    }

    fn store_sample(&self, slot: &AtomicU64, started: Instant) {
        let nanos = started.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64;
        slot.store(nanos, Ordering::Relaxed);
    }

    /// One timer tick.
    ///
    /// Returns `Ok(false)` when the tick was skipped because its timer had
    /// been cancelled while the tick was queued, or when it failed after the
    /// worker was paused or stopped.
    pub(crate) fn execute(
        &self,
        mode: TickMode,
        ctx: &HostContext,
        cancelled: &AtomicBool,
    ) -> Result<bool, SchedulerError> {
        let mut core = lock(&self.core);
        let owed = self.owed_computes.swap(0, Ordering::AcqRel);
        if cancelled.load(Ordering::Acquire) {
            trace!("Worker {}: tick skipped, timer cancelled", self.id);
            return Ok(false);
        }

        let timing = self.timing.load(Ordering::Relaxed);
        let WorkerCore { worker, back } = &mut *core;

        back.begin_draw();
        back.clear();

        let computes = match mode {
            TickMode::Full => 1,
            TickMode::RenderOnly => owed,
        };
        for _ in 0..computes {
            let started = Instant::now();
            let result = run_guarded(|| worker.compute(ctx));
            if timing {
                self.store_sample(&self.compute_nanos, started);
            }
            if let Err(message) = result {
                back.end_draw();
                return self.fail(Phase::Compute, message, cancelled.load(Ordering::Acquire));
            }
        }

        let started = Instant::now();
        let result = run_guarded(|| worker.render(back, ctx));
        if timing {
            self.store_sample(&self.render_nanos, started);
        }
        back.end_draw();
        if let Err(message) = result {
            return self.fail(Phase::Render, message, cancelled.load(Ordering::Acquire));
        }

        // publish the finished frame; the old front becomes the next back buffer
        std::mem::swap(&mut *lock(&self.front), back);
        self.ticks.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Runs `compute` on the calling thread (decoupled mode) unless a tick
    /// is executing, in which case the compute is owed to the next tick.
    /// Never blocks on a render.
    ///
    /// Returns `Ok(false)` when the compute was deferred.
    pub(crate) fn compute_or_defer(&self, ctx: &HostContext) -> Result<bool, SchedulerError> {
        let mut core = match self.core.try_lock() {
            Ok(core) => core,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                let owed = self.owed_computes.fetch_add(1, Ordering::AcqRel) + 1;
                trace!("Worker {}: tick in flight, {} computes owed", self.id, owed);
                return Ok(false);
            }
        };
        let started = Instant::now();
        let result = run_guarded(|| core.worker.compute(ctx));
        if self.timing.load(Ordering::Relaxed) {
            self.store_sample(&self.compute_nanos, started);
        }
        match result {
            Ok(()) => Ok(true),
            Err(message) => self.fail(Phase::Compute, message, false),
        }
    }

    /// Blocks until no tick of this worker is executing.
    pub(crate) fn wait_idle(&self) {
        drop(lock(&self.core));
    }

    /// Blanks both buffers. Waits for an in-flight tick first.
    pub(crate) fn clear(&self) {
        let mut core = lock(&self.core);
        core.back.clear();
        lock(&self.front).clear();
    }

    /// Reallocates both buffers. Waits for an in-flight tick first.
    /// The last published frame is carried over, clipped or padded.
    pub(crate) fn resize(&self, width: u32, height: u32) {
        let mut core = lock(&self.core);
        core.back = S::create(width, height);
        let mut front = lock(&self.front);
        let mut resized = S::create(width, height);
        resized.draw_surface(&front, 0, 0);
        *front = resized;
        debug!("Worker {}: resized to {}x{}", self.id, width, height);
    }

    pub(crate) fn front(&self) -> MutexGuard<'_, S> {
        lock(&self.front)
    }
}

/// Cloneable handle to a worker created by a scheduler.
///
/// Identity is by [`WorkerId`]; clones refer to the same worker.
pub struct WorkerHandle<S: Surface = PixelSurface> {
    shared: Arc<WorkerShared<S>>,
}

impl<S: Surface> Clone for WorkerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Surface> std::fmt::Debug for WorkerHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl<S: Surface> WorkerHandle<S> {
    /// Wraps `worker` with private surfaces of the given size.
    pub(crate) fn new<W: Worker<S>>(worker: W, width: u32, height: u32, timing: bool) -> Self {
        let shared = WorkerShared {
            id: WorkerId::next(),
            core: Mutex::new(WorkerCore {
                worker: Box::new(worker),
                back: S::create(width, height),
            }),
            front: Mutex::new(S::create(width, height)),
            state: AtomicU8::new(WorkerState::Idle as u8),
            timing: AtomicBool::new(timing),
            compute_nanos: AtomicU64::new(0),
            render_nanos: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            owed_computes: AtomicU64::new(0),
            fault: Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<WorkerShared<S>> {
        &self.shared
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Number of ticks that completed and published a frame.
    pub fn tick_count(&self) -> u64 {
        self.shared.ticks.load(Ordering::Relaxed)
    }

    /// Most recent user-code failure, if any.
    pub fn fault(&self) -> Option<WorkerFault> {
        lock(&self.shared.fault).clone()
    }

    pub fn enable_timing(&self) {
        self.shared.timing.store(true, Ordering::Relaxed);
    }

    /// Stops collecting timings. Stored samples go stale.
    pub fn disable_timing(&self) {
        self.shared.timing.store(false, Ordering::Relaxed);
    }

    pub fn is_timing(&self) -> bool {
        self.shared.timing.load(Ordering::Relaxed)
    }

    /// Duration of the last timed compute phase.
    pub fn compute_time(&self) -> Duration {
        Duration::from_nanos(self.shared.compute_nanos.load(Ordering::Relaxed))
    }

    /// Duration of the last timed render phase.
    pub fn render_time(&self) -> Duration {
        Duration::from_nanos(self.shared.render_nanos.load(Ordering::Relaxed))
    }

    /// Compute phases per second implied by the last sample.
    ///
    /// Enables timing as a side effect, so the first call usually reports
    /// a stale or zero sample. Returns 0 when no sample exists.
    pub fn compute_rate(&self) -> f32 {
        self.enable_timing();
        rate_from(self.compute_time())
    }

    /// Render phases per second implied by the last sample. See
    /// [`compute_rate`](Self::compute_rate).
    pub fn render_rate(&self) -> f32 {
        self.enable_timing();
        rate_from(self.render_time())
    }

    /// Reads the last published frame.
    pub fn with_frame<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.shared.front())
    }
}

fn rate_from(sample: Duration) -> f32 {
    let millis = sample.as_secs_f32() * 1000.0;
    if millis > 0.0 {
        1000.0 / millis
    } else {
        0.0
    }
}
