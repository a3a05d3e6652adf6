// src/scheduler/manager.rs
//! Scheduler - owns the workers, their timers and the presentation step.

use crate::config::SchedulerConfig;
use crate::context::HostContext;
use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::pool::ExecutionPool;
use crate::scheduler::timer::{period_for_fps, Dispatcher, Task, TimerHandle};
use crate::surface::{PixelSurface, Surface};
use crate::worker::{TickMode, Worker, WorkerHandle, WorkerId, WorkerState};
use log::*;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

type ErrorHandler = dyn Fn(&SchedulerError) + Send + Sync + 'static;

fn report(handler: &RwLock<Arc<ErrorHandler>>, err: &SchedulerError) {
    let handler = Arc::clone(&*handler.read().unwrap_or_else(PoisonError::into_inner));
    handler(err);
}

struct Registration<S: Surface> {
    worker: WorkerHandle<S>,
    timer: TimerHandle,
    /// per-worker override of the default rate
    fps: Option<u32>,
}

/// Workers returned by a pause, for waiting on or clearing them afterwards.
pub struct PauseToken<S: Surface = PixelSurface> {
    workers: Vec<WorkerHandle<S>>,
}

impl<S: Surface> PauseToken<S> {
    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(WorkerHandle::id).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Blocks until every tick that was in flight at pause time has finished.
    pub fn wait(&self) {
        for worker in &self.workers {
            worker.shared().wait_idle();
        }
    }

    /// Waits for in-flight ticks, then blanks each worker's surfaces.
    pub fn clear(self) {
        for worker in &self.workers {
            worker.shared().clear();
            trace!("Worker {}: cleared", worker.id());
        }
    }
}

/// Runs workers on independent fixed-rate timers and composites their
/// surfaces once per host frame.
///
/// All methods take `&mut self` or `&self` and are meant to be called from
/// the host's main loop thread.
pub struct Scheduler<S: Surface = PixelSurface> {
    config: SchedulerConfig,
    dispatcher: Dispatcher,
    order: Vec<WorkerId>,
    registry: HashMap<WorkerId, Registration<S>>,
    context: Arc<RwLock<HostContext>>,
    error_handler: Arc<RwLock<Arc<ErrorHandler>>>,
    decoupled: bool,
    width: u32,
    height: u32,
    frames_presented: u64,
    shut_down: bool,
}

impl<S: Surface> Scheduler<S> {
    /// Starts the execution pool and timer thread for a display of the
    /// given size.
    pub fn new(config: SchedulerConfig, width: u32, height: u32) -> SchedulerResult<Self> {
        config.validate()?;
        let pool = ExecutionPool::new(config.effective_pool_size(), &config.thread_name_prefix)?;
        let dispatcher = Dispatcher::spawn(pool)?;
        let default_handler: Arc<ErrorHandler> = Arc::new(|err: &SchedulerError| {
            error!("Scheduler: {}", err);
        });

        info!(
            "Scheduler: started ({}x{}, default {} FPS, {} slots, {})",
            width,
            height,
            config.default_fps,
            dispatcher.pool_size(),
            if config.decoupled { "decoupled" } else { "coupled" }
        );

        Ok(Self {
            decoupled: config.decoupled,
            config,
            dispatcher,
            order: Vec::new(),
            registry: HashMap::new(),
            context: Arc::new(RwLock::new(HostContext::new(width, height))),
            error_handler: Arc::new(RwLock::new(default_handler)),
            width,
            height,
            frames_presented: 0,
            shut_down: false,
        })
    }

    /// Scheduler with default settings and the given default rate.
    pub fn with_default_fps(default_fps: u32, width: u32, height: u32) -> SchedulerResult<Self> {
        Self::new(
            SchedulerConfig {
                default_fps,
                ..SchedulerConfig::default()
            },
            width,
            height,
        )
    }

    // --- Registration ---

    /// Wraps `worker` with private surfaces sized to the current display.
    /// The worker does not run until added.
    pub fn create_worker<W: Worker<S>>(&self, worker: W) -> WorkerHandle<S> {
        WorkerHandle::new(worker, self.width, self.height, self.config.timing)
    }

    /// Registers a worker and starts ticking it immediately.
    ///
    /// `fps` overrides the default rate for this worker only.
    pub fn add_worker(&mut self, worker: &WorkerHandle<S>, fps: Option<u32>) -> SchedulerResult<()> {
        if self.shut_down {
            return Err(SchedulerError::ShutDown);
        }
        validate_fps(fps)?;
        let id = worker.id();
        if self.registry.contains_key(&id) {
            return Err(SchedulerError::invalid_argument(format!(
                "worker {} is already registered",
                id
            )));
        }
        match worker.state() {
            WorkerState::Idle => {}
            WorkerState::Stopped => {
                return Err(SchedulerError::invalid_argument(format!(
                    "worker {} was stopped and cannot be re-added",
                    id
                )));
            }
            _ => {
                return Err(SchedulerError::invalid_argument(format!(
                    "worker {} belongs to another scheduler",
                    id
                )));
            }
        }

        let needs_resize = worker.with_frame(|s| s.size() != (self.width, self.height));
        if needs_resize {
            worker.shared().resize(self.width, self.height);
        }

        worker.shared().set_state(WorkerState::Running);
        let timer = self.schedule(worker, fps.unwrap_or(self.config.default_fps));
        self.registry.insert(
            id,
            Registration {
                worker: worker.clone(),
                timer,
                fps,
            },
        );
        self.order.push(id);
        info!(
            "Scheduler: added worker {} at {} FPS",
            id,
            fps.unwrap_or(self.config.default_fps)
        );
        Ok(())
    }

    /// Creates and registers a worker in one step.
    pub fn spawn_worker<W: Worker<S>>(
        &mut self,
        worker: W,
        fps: Option<u32>,
    ) -> SchedulerResult<WorkerHandle<S>> {
        let handle = self.create_worker(worker);
        self.add_worker(&handle, fps)?;
        Ok(handle)
    }

    /// Builds `count` workers with `factory` and registers them all.
    ///
    /// The factory receives the worker index and the current host context.
    /// If any construction fails nothing is registered.
    pub fn add_workers<W, F>(
        &mut self,
        mut factory: F,
        count: usize,
        fps: Option<u32>,
    ) -> SchedulerResult<Vec<WorkerHandle<S>>>
    where
        W: Worker<S>,
        F: FnMut(usize, &HostContext) -> anyhow::Result<W>,
    {
        if self.shut_down {
            return Err(SchedulerError::ShutDown);
        }
        if count == 0 {
            return Err(SchedulerError::invalid_argument(
                "worker count must be greater than 0",
            ));
        }
        validate_fps(fps)?;

        let ctx = self.context();
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let worker = factory(index, &ctx)
                .map_err(|source| SchedulerError::ConstructionFailure { index, source })?;
            handles.push(self.create_worker(worker));
        }
        for handle in &handles {
            self.add_worker(handle, fps)?;
        }
        Ok(handles)
    }

    fn schedule(&self, worker: &WorkerHandle<S>, fps: u32) -> TimerHandle {
        let mode = if self.decoupled {
            TickMode::RenderOnly
        } else {
            TickMode::Full
        };
        let shared = Arc::clone(worker.shared());
        let context = Arc::clone(&self.context);
        let handler = Arc::clone(&self.error_handler);
        let task: Task = Arc::new(move |timer: &TimerHandle| {
            let ctx = *context.read().unwrap_or_else(PoisonError::into_inner);
            match shared.execute(mode, &ctx, timer.cancelled_flag()) {
                Ok(true) => trace!("Worker {}: tick", shared.id()),
                Ok(false) => {}
                Err(err) => {
                    timer.cancel();
                    report(&handler, &err);
                }
            }
        });
        self.dispatcher.schedule(period_for_fps(fps), task)
    }

    fn effective_fps(&self, reg: &Registration<S>) -> u32 {
        reg.fps.unwrap_or(self.config.default_fps)
    }

    fn registrations(&self) -> impl Iterator<Item = &Registration<S>> + '_ {
        self.order.iter().filter_map(move |id| self.registry.get(id))
    }

    // --- Pause / Resume / Stop ---

    /// Cancels the timers of the given workers. Does not wait for a tick
    /// that is already running; use the returned token for that.
    ///
    /// Paused workers keep presenting their last frame.
    pub fn pause(&mut self, ids: &[WorkerId]) -> PauseToken<S> {
        let mut workers = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(reg) = self.registry.get(id) else {
                warn!("Scheduler: pause of unknown worker {} ignored", id);
                continue;
            };
            if reg.worker.state() == WorkerState::Running {
                reg.timer.cancel();
                reg.worker.shared().set_state(WorkerState::Paused);
                debug!("Scheduler: paused worker {}", id);
            }
            workers.push(reg.worker.clone());
        }
        PauseToken { workers }
    }

    pub fn pause_all(&mut self) -> PauseToken<S> {
        let ids = self.order.clone();
        self.pause(&ids)
    }

    /// Pauses the workers and blanks their surfaces once any in-flight
    /// tick has finished.
    pub fn pause_and_clear(&mut self, ids: &[WorkerId]) {
        self.pause(ids).clear();
    }

    pub fn pause_and_clear_all(&mut self) {
        self.pause_all().clear();
    }

    /// Restarts paused or faulted workers at their recorded rate.
    /// Running workers are left alone.
    pub fn resume(&mut self, ids: &[WorkerId]) {
        if self.shut_down {
            warn!("Scheduler: resume after shutdown ignored");
            return;
        }
        for id in ids {
            let Some(reg) = self.registry.get(id) else {
                warn!("Scheduler: resume of unknown worker {} ignored", id);
                continue;
            };
            if !matches!(
                reg.worker.state(),
                WorkerState::Paused | WorkerState::Faulted
            ) {
                continue;
            }
            let worker = reg.worker.clone();
            let fps = self.effective_fps(reg);

            if let Some(fault) = worker.shared().take_fault() {
                debug!(
                    "Scheduler: clearing {} fault of worker {}",
                    fault.phase, id
                );
            }
            worker.shared().set_state(WorkerState::Running);
            let timer = self.schedule(&worker, fps);
            if let Some(reg) = self.registry.get_mut(id) {
                reg.timer = timer;
            }
            debug!("Scheduler: resumed worker {} at {} FPS", id, fps);
        }
    }

    pub fn resume_all(&mut self) {
        let ids = self.order.clone();
        self.resume(&ids);
    }

    /// Cancels and removes workers. A stopped worker cannot be resumed or
    /// added again, and its rate override is forgotten.
    pub fn stop(&mut self, ids: &[WorkerId]) {
        for id in ids {
            let Some(reg) = self.registry.remove(id) else {
                warn!("Scheduler: stop of unknown worker {} ignored", id);
                continue;
            };
            reg.timer.cancel();
            reg.worker.shared().set_state(WorkerState::Stopped);
            self.order.retain(|other| other != id);
            debug!("Scheduler: stopped worker {}", id);
        }
    }

    pub fn stop_all(&mut self) {
        let ids = self.order.clone();
        self.stop(&ids);
    }

    // --- Compute/Render coupling ---

    /// Moves every worker's `compute` into `present`; timers then only
    /// render. Affects existing and future workers.
    pub fn unlink_compute_and_render(&mut self) {
        if self.decoupled {
            return;
        }
        self.decoupled = true;
        self.reschedule_running();
        debug!("Scheduler: compute and render unlinked");
    }

    /// Restores compute + render inside each worker's own tick (default).
    pub fn link_compute_and_render(&mut self) {
        if !self.decoupled {
            return;
        }
        self.decoupled = false;
        self.reschedule_running();
        debug!("Scheduler: compute and render linked");
    }

    pub fn is_decoupled(&self) -> bool {
        self.decoupled
    }

    /// Replaces the timer of every running worker so the current tick mode
    /// applies to all of them.
    fn reschedule_running(&mut self) {
        let running: Vec<(WorkerId, WorkerHandle<S>, u32)> = self
            .registrations()
            .filter(|reg| !reg.timer.is_cancelled())
            .map(|reg| (reg.worker.id(), reg.worker.clone(), self.effective_fps(reg)))
            .collect();
        for (id, worker, fps) in running {
            let timer = self.schedule(&worker, fps);
            if let Some(reg) = self.registry.get_mut(&id) {
                reg.timer.cancel();
                reg.timer = timer;
            }
        }
    }

    // --- Presentation ---

    /// Composites every worker's latest frame onto `output` at the origin,
    /// in insertion order. Call exactly once per host frame.
    ///
    /// Resizes the workers first if `output` changed size. In decoupled
    /// mode, runs `compute` for every running worker before compositing; a
    /// worker that is mid-tick gets that compute at the start of its next
    /// tick instead, so `present` never waits for a render.
    /// Returns the number of surfaces drawn.
    pub fn present(&mut self, output: &mut S) -> usize {
        let (width, height) = output.size();
        if (width, height) != (self.width, self.height) {
            self.resize(width, height);
        }

        if self.decoupled {
            let ctx = self.context();
            for reg in self.registrations() {
                if reg.timer.is_cancelled() {
                    continue;
                }
                if let Err(err) = reg.worker.shared().compute_or_defer(&ctx) {
                    reg.timer.cancel();
                    report(&self.error_handler, &err);
                }
            }
        }

        let mut presented = 0;
        for reg in self.registrations() {
            let frame = reg.worker.shared().front();
            output.draw_surface(&frame, 0, 0);
            presented += 1;
        }
        self.frames_presented += 1;
        trace!(
            "Scheduler: frame {} presented {} surfaces",
            self.frames_presented,
            presented
        );
        presented
    }

    /// Reallocates every worker's surfaces for a new display size.
    /// Rates and pause state are kept.
    pub fn resize(&mut self, width: u32, height: u32) {
        if (width, height) == (self.width, self.height) {
            return;
        }
        info!(
            "Scheduler: display resized {}x{} -> {}x{}",
            self.width, self.height, width, height
        );
        self.width = width;
        self.height = height;
        {
            let mut ctx = self.context.write().unwrap_or_else(PoisonError::into_inner);
            ctx.width = width;
            ctx.height = height;
        }
        for reg in self.registrations() {
            reg.worker.shared().resize(width, height);
        }
    }

    /// Replaces the host context workers see from their next tick on.
    pub fn set_context(&mut self, ctx: HostContext) {
        *self.context.write().unwrap_or_else(PoisonError::into_inner) = ctx;
    }

    pub fn context(&self) -> HostContext {
        *self.context.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs the receiver of worker failures. Called from pool threads
    /// and from `present`.
    pub fn set_error_handler<F>(&mut self, handler: F)
    where
        F: Fn(&SchedulerError) + Send + Sync + 'static,
    {
        let handler: Arc<ErrorHandler> = Arc::new(handler);
        *self
            .error_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = handler;
    }

    // --- Queries ---

    /// True if at least one worker has a live timer.
    pub fn is_running(&self) -> bool {
        self.registrations().any(|reg| !reg.timer.is_cancelled())
    }

    /// Registered workers, paused ones included.
    pub fn worker_count(&self) -> usize {
        self.order.len()
    }

    /// Registered worker ids in insertion order.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.order.clone()
    }

    pub fn worker(&self, id: WorkerId) -> Option<WorkerHandle<S>> {
        self.registry.get(&id).map(|reg| reg.worker.clone())
    }

    pub fn state(&self, id: WorkerId) -> Option<WorkerState> {
        self.registry.get(&id).map(|reg| reg.worker.state())
    }

    /// Effective target rate of a registered worker.
    pub fn fps(&self, id: WorkerId) -> Option<u32> {
        self.registry.get(&id).map(|reg| self.effective_fps(reg))
    }

    pub fn default_fps(&self) -> u32 {
        self.config.default_fps
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn pool_size(&self) -> usize {
        self.dispatcher.pool_size()
    }

    /// Mean compute rate (per second) over running workers.
    ///
    /// Turns timing on for those workers as a side effect, so the first
    /// reading after startup is unreliable. Returns 0 with no running worker.
    pub fn average_compute_rate(&self) -> f32 {
        self.average_rate(WorkerHandle::compute_rate)
    }

    /// Mean render rate (per second) over running workers.
    /// See [`average_compute_rate`](Self::average_compute_rate).
    pub fn average_render_rate(&self) -> f32 {
        self.average_rate(WorkerHandle::render_rate)
    }

    fn average_rate(&self, rate: fn(&WorkerHandle<S>) -> f32) -> f32 {
        let (count, sum) = self
            .registrations()
            .filter(|reg| !reg.timer.is_cancelled())
            .fold((0usize, 0.0f32), |(n, sum), reg| {
                (n + 1, sum + rate(&reg.worker))
            });
        if count > 0 {
            sum / count as f32
        } else {
            0.0
        }
    }

    // --- Teardown ---

    /// Cancels every timer, stops the timer thread and joins the pool.
    /// Further registrations fail with `ShutDown`. Safe to call twice.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        for reg in self.registry.values() {
            reg.timer.cancel();
        }
        self.dispatcher.shutdown();
        info!(
            "Scheduler: shut down after {} frames, {} workers",
            self.frames_presented,
            self.order.len()
        );
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl<S: Surface> Drop for Scheduler<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn validate_fps(fps: Option<u32>) -> SchedulerResult<()> {
    if fps == Some(0) {
        return Err(SchedulerError::invalid_argument(
            "target FPS must be greater than 0",
        ));
    }
    Ok(())
}
