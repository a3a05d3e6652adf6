// src/host.rs
//! Host frame loop.
//!
//! `HostLoop` owns the shared output surface and a [`Scheduler`], and paces
//! host frames at a fixed rate. Each frame it refreshes the host context,
//! lets the [`Sketch`] draw, and then presents every worker's surface on top
//! (when presentation is bound).

use crate::config::Config;
use crate::context::HostContext;
use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::timer::period_for_fps;
use crate::scheduler::Scheduler;
use crate::surface::{PixelSurface, Surface};
use anyhow::Context;
use log::*;
use std::thread;
use std::time::{Duration, Instant};

/// The host-side program driven by a [`HostLoop`].
pub trait Sketch<S: Surface = PixelSurface> {
    /// Runs once before the first frame. Typically registers workers.
    fn setup(&mut self, scheduler: &mut Scheduler<S>, ctx: &HostContext) -> anyhow::Result<()>;

    /// Draws the host's own content for this frame. Worker surfaces are
    /// presented on top of it afterwards.
    fn draw(
        &mut self,
        output: &mut S,
        scheduler: &mut Scheduler<S>,
        ctx: &HostContext,
    ) -> anyhow::Result<()> {
        let _ = (output, scheduler, ctx);
        Ok(())
    }

    /// Checked after every frame.
    fn should_exit(&self, ctx: &HostContext) -> bool {
        let _ = ctx;
        false
    }
}

pub struct HostLoop<S: Surface = PixelSurface> {
    scheduler: Scheduler<S>,
    output: S,
    period: Duration,
    present_bound: bool,
    set_up: bool,
    frame_count: u64,
    pointer: (f32, f32, bool),
}

impl<S: Surface> HostLoop<S> {
    pub fn new(config: &Config) -> SchedulerResult<Self> {
        let host = &config.host;
        if host.fps == 0 {
            return Err(SchedulerError::invalid_argument(
                "host fps must be greater than 0",
            ));
        }
        let scheduler = Scheduler::new(config.scheduler.clone(), host.width, host.height)?;
        info!(
            "HostLoop: {}x{} at {} FPS",
            host.width, host.height, host.fps
        );
        Ok(Self {
            scheduler,
            output: S::create(host.width, host.height),
            period: period_for_fps(host.fps),
            present_bound: true,
            set_up: false,
            frame_count: 0,
            pointer: (0.0, 0.0, false),
        })
    }

    pub fn scheduler(&self) -> &Scheduler<S> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler<S> {
        &mut self.scheduler
    }

    pub fn output(&self) -> &S {
        &self.output
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Presents worker surfaces after each `draw` (the default).
    pub fn bind_present(&mut self) {
        if !self.present_bound {
            self.present_bound = true;
            debug!("HostLoop: present bound");
        }
    }

    /// Stops presenting worker surfaces; workers keep ticking.
    pub fn unbind_present(&mut self) {
        if self.present_bound {
            self.present_bound = false;
            debug!("HostLoop: present unbound");
        }
    }

    pub fn is_present_bound(&self) -> bool {
        self.present_bound
    }

    /// Pointer state handed to workers from the next frame on.
    pub fn set_pointer(&mut self, x: f32, y: f32, pressed: bool) {
        self.pointer = (x, y, pressed);
    }

    /// Replaces the output surface. Workers follow on the next `present`.
    pub fn resize_output(&mut self, width: u32, height: u32) {
        if self.output.size() != (width, height) {
            self.output = S::create(width, height);
        }
    }

    fn context(&self) -> HostContext {
        let (width, height) = self.output.size();
        HostContext {
            width,
            height,
            frame_count: self.frame_count,
            pointer_x: self.pointer.0,
            pointer_y: self.pointer.1,
            pointer_pressed: self.pointer.2,
        }
    }

    fn ensure_setup<K: Sketch<S>>(&mut self, sketch: &mut K) -> anyhow::Result<()> {
        if self.set_up {
            return Ok(());
        }
        let ctx = self.context();
        self.scheduler.set_context(ctx);
        sketch
            .setup(&mut self.scheduler, &ctx)
            .context("Sketch setup failed")?;
        self.set_up = true;
        Ok(())
    }

    /// Runs a single host frame without pacing.
    pub fn step<K: Sketch<S>>(&mut self, sketch: &mut K) -> anyhow::Result<()> {
        self.ensure_setup(sketch)?;

        let ctx = self.context();
        self.scheduler.set_context(ctx);

        self.output.begin_draw();
        self.output.clear();
        let drawn = sketch.draw(&mut self.output, &mut self.scheduler, &ctx);
        if drawn.is_ok() && self.present_bound {
            self.scheduler.present(&mut self.output);
        }
        self.output.end_draw();
        drawn.with_context(|| format!("Sketch draw failed at frame {}", ctx.frame_count))?;

        self.frame_count += 1;
        trace!("HostLoop: frame {} done", self.frame_count);
        Ok(())
    }

    /// Runs up to `frames` paced frames, stopping early if the sketch asks
    /// to exit. Returns the number of frames run. Does not shut down.
    pub fn run_frames<K: Sketch<S>>(&mut self, sketch: &mut K, frames: u64) -> anyhow::Result<u64> {
        let start = Instant::now();
        let mut ran = 0;
        let mut slot: u32 = 0;
        while ran < frames {
            self.step(sketch)?;
            ran += 1;
            if sketch.should_exit(&self.context()) {
                info!("HostLoop: sketch requested exit after {} frames", ran);
                break;
            }
            if ran < frames {
                slot = self.wait_for_next_slot(start, slot);
            }
        }
        Ok(ran)
    }

    /// Runs until the sketch asks to exit, then shuts the scheduler down.
    pub fn run<K: Sketch<S>>(&mut self, sketch: &mut K) -> anyhow::Result<()> {
        let result = self.run_frames(sketch, u64::MAX);
        self.shutdown();
        result.map(|_| ())
    }

    /// Sleeps until the next frame slot after `slot`. Slots that already
    /// passed are skipped.
    fn wait_for_next_slot(&self, start: Instant, slot: u32) -> u32 {
        let now = Instant::now();
        let mut next = slot.saturating_add(1);
        let mut deadline = start + self.period * next;
        if deadline <= now {
            let behind = (now - start).as_nanos() / self.period.as_nanos().max(1);
            next = u32::try_from(behind + 1).unwrap_or(u32::MAX);
            deadline = start + self.period * next;
            trace!("HostLoop: frame overran, skipping to slot {}", next);
        }
        thread::sleep(deadline.saturating_duration_since(now));
        next
    }

    pub fn shutdown(&mut self) {
        self.scheduler.shutdown();
    }
}
