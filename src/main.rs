// src/main.rs

use anyhow::Context;
use log::{info, warn};
use sketch_threads::{
    Config, HostContext, HostLoop, PixelSurface, Rgba, Scheduler, Sketch, Worker, WorkerHandle,
};

/// Frames the demo runs before exiting.
const DEMO_FRAMES: u64 = 180;

/// A square bouncing around the display.
struct Bouncer {
    x: f32,
    y: f32,
    vx: f32,
    vy: f32,
    size: u32,
    color: Rgba,
}

impl Bouncer {
    fn new(index: usize, ctx: &HostContext) -> Self {
        let i = index as f32;
        Self {
            x: (ctx.width as f32 * 0.1 * (i + 1.0)) % ctx.width.max(1) as f32,
            y: (ctx.height as f32 * 0.15 * (i + 1.0)) % ctx.height.max(1) as f32,
            vx: 3.0 + i,
            vy: 2.0 + i * 0.5,
            size: 24,
            color: Rgba::from_rgba((index as u8).wrapping_mul(70).wrapping_add(40), 120, 220, 200),
        }
    }
}

impl Worker for Bouncer {
    fn compute(&mut self, ctx: &HostContext) -> anyhow::Result<()> {
        let max_x = ctx.width.saturating_sub(self.size) as f32;
        let max_y = ctx.height.saturating_sub(self.size) as f32;
        self.x += self.vx;
        self.y += self.vy;
        if self.x <= 0.0 || self.x >= max_x {
            self.vx = -self.vx;
            self.x = self.x.clamp(0.0, max_x);
        }
        if self.y <= 0.0 || self.y >= max_y {
            self.vy = -self.vy;
            self.y = self.y.clamp(0.0, max_y);
        }
        Ok(())
    }

    fn render(&mut self, surface: &mut PixelSurface, _ctx: &HostContext) -> anyhow::Result<()> {
        surface.fill_rect(self.x as i32, self.y as i32, self.size, self.size, self.color);
        Ok(())
    }
}

#[derive(Default)]
struct Demo {
    slow: Vec<WorkerHandle>,
    fast: Vec<WorkerHandle>,
}

impl Sketch for Demo {
    fn setup(&mut self, scheduler: &mut Scheduler, _ctx: &HostContext) -> anyhow::Result<()> {
        self.slow = scheduler
            .add_workers(|i, ctx| Ok(Bouncer::new(i, ctx)), 2, Some(30))
            .context("Failed to add 30 FPS workers")?;
        self.fast = scheduler
            .add_workers(|i, ctx| Ok(Bouncer::new(i + 2, ctx)), 2, Some(60))
            .context("Failed to add 60 FPS workers")?;
        info!("Demo: {} workers registered", scheduler.worker_count());
        Ok(())
    }

    fn draw(
        &mut self,
        output: &mut PixelSurface,
        scheduler: &mut Scheduler,
        ctx: &HostContext,
    ) -> anyhow::Result<()> {
        output.fill(Rgba::rgb(16, 16, 24));

        // halfway through, freeze the slow workers for a second
        if ctx.frame_count == DEMO_FRAMES / 2 {
            let ids: Vec<_> = self.slow.iter().map(WorkerHandle::id).collect();
            scheduler.pause(&ids);
            info!("Demo: paused {} slow workers", ids.len());
        }
        if ctx.frame_count == DEMO_FRAMES / 2 + 60 {
            scheduler.resume_all();
            info!("Demo: resumed all workers");
        }
        if ctx.frame_count % 60 == 0 {
            info!(
                "Demo: frame {} render rate {:.0}/s",
                ctx.frame_count,
                scheduler.average_render_rate()
            );
        }
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    info!("Starting sketch-threads demo...");

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => {
            info!("No configuration file given, using defaults");
            Config::default()
        }
    };

    let mut host: HostLoop = HostLoop::new(&config).context("Failed to start host loop")?;
    let mut demo = Demo::default();
    let frames = host
        .run_frames(&mut demo, DEMO_FRAMES)
        .context("Demo sketch failed")?;

    for worker in demo.slow.iter().chain(&demo.fast) {
        info!(
            "Worker {}: {} ticks, state {:?}",
            worker.id(),
            worker.tick_count(),
            worker.state()
        );
        if let Some(fault) = worker.fault() {
            warn!("Worker {}: {} fault: {}", worker.id(), fault.phase, fault.message);
        }
    }

    host.shutdown();
    info!("Demo finished after {} frames", frames);
    Ok(())
}
