// src/worker/tests.rs

use super::*;
use crate::error::{Phase, SchedulerError};
use crate::surface::Rgba;
use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use test_log::test;

/// Records phase order and paints one pixel per tick.
struct Recorder {
    calls: Arc<Mutex<Vec<&'static str>>>,
}

impl Worker for Recorder {
    fn compute(&mut self, _ctx: &HostContext) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push("compute");
        Ok(())
    }

    fn render(&mut self, surface: &mut PixelSurface, _ctx: &HostContext) -> anyhow::Result<()> {
        assert!(surface.is_drawing());
        assert!(surface.is_blank(), "surface is cleared before render");
        self.calls.lock().unwrap().push("render");
        surface.set_pixel(0, 0, Rgba::WHITE);
        Ok(())
    }
}

fn recorder(width: u32, height: u32) -> (WorkerHandle, Arc<Mutex<Vec<&'static str>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let handle = WorkerHandle::new(
        Recorder {
            calls: Arc::clone(&calls),
        },
        width,
        height,
        false,
    );
    (handle, calls)
}

fn live() -> AtomicBool {
    AtomicBool::new(false)
}

#[test]
fn ids_are_unique() {
    let (a, _) = recorder(1, 1);
    let (b, _) = recorder(1, 1);
    assert_ne!(a.id(), b.id());
    assert_eq!(a.clone().id(), a.id());
    assert_eq!(a.state(), WorkerState::Idle);
}

#[test]
fn full_tick_runs_compute_then_render_and_publishes() {
    let (handle, calls) = recorder(2, 2);
    let ctx = HostContext::new(2, 2);

    assert!(handle.with_frame(|s| s.is_blank()));
    let ran = handle.shared().execute(TickMode::Full, &ctx, &live()).unwrap();

    assert!(ran);
    assert_eq!(*calls.lock().unwrap(), vec!["compute", "render"]);
    assert_eq!(handle.tick_count(), 1);
    assert_eq!(handle.with_frame(|s| s.pixel(0, 0)), Some(Rgba::WHITE));
}

#[test]
fn render_only_tick_skips_compute() {
    let (handle, calls) = recorder(1, 1);
    let ctx = HostContext::new(1, 1);
    handle
        .shared()
        .execute(TickMode::RenderOnly, &ctx, &live())
        .unwrap();
    assert_eq!(*calls.lock().unwrap(), vec!["render"]);
}

#[test]
fn cancelled_tick_does_nothing() {
    let (handle, calls) = recorder(1, 1);
    let cancelled = AtomicBool::new(true);
    let ran = handle
        .shared()
        .execute(TickMode::Full, &HostContext::default(), &cancelled)
        .unwrap();
    assert!(!ran);
    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(handle.tick_count(), 0);
}

#[test]
fn back_buffer_is_cleared_every_tick() {
    // Recorder asserts the surface it receives is blank; two ticks exercise
    // the swapped-in former front buffer.
    let (handle, calls) = recorder(1, 1);
    let ctx = HostContext::new(1, 1);
    for _ in 0..3 {
        handle.shared().execute(TickMode::Full, &ctx, &live()).unwrap();
    }
    assert_eq!(calls.lock().unwrap().len(), 6);
}

#[test]
fn render_error_is_recorded_as_fault() {
    let handle: WorkerHandle = WorkerHandle::new(
        FnWorker(|_s: &mut PixelSurface, _c: &HostContext| -> anyhow::Result<()> {
            anyhow::bail!("no ink")
        }),
        1,
        1,
        false,
    );
    handle.shared().set_state(WorkerState::Running);
    let err = handle
        .shared()
        .execute(TickMode::Full, &HostContext::default(), &live())
        .unwrap_err();

    match err {
        SchedulerError::UserCodeFailure { worker, phase, .. } => {
            assert_eq!(worker, handle.id());
            assert_eq!(phase, Phase::Render);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(handle.state(), WorkerState::Faulted);
    assert_eq!(handle.fault().unwrap().message, "no ink");
    assert_eq!(handle.tick_count(), 0);
}

struct PanicsInCompute;

impl Worker for PanicsInCompute {
    fn compute(&mut self, _ctx: &HostContext) -> anyhow::Result<()> {
        panic!("divide by zero");
    }

    fn render(&mut self, _s: &mut PixelSurface, _ctx: &HostContext) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn compute_panic_is_caught() {
    let handle: WorkerHandle = WorkerHandle::new(PanicsInCompute, 1, 1, false);
    handle.shared().set_state(WorkerState::Running);
    let err = handle
        .shared()
        .execute(TickMode::Full, &HostContext::default(), &live())
        .unwrap_err();
    assert!(err.to_string().contains("divide by zero"));
    let fault = handle.fault().unwrap();
    assert_eq!(fault.phase, Phase::Compute);

    // the worker lock is not poisoned; a render-only tick still works
    handle
        .shared()
        .execute(TickMode::RenderOnly, &HostContext::default(), &live())
        .unwrap();
}

#[test]
fn timing_is_only_collected_when_enabled() {
    let (handle, _) = recorder(1, 1);
    let ctx = HostContext::new(1, 1);
    handle.shared().execute(TickMode::Full, &ctx, &live()).unwrap();
    assert_eq!(handle.render_time(), std::time::Duration::ZERO);
    assert_eq!(handle.render_rate(), 0.0);

    // render_rate enabled timing as a side effect
    assert!(handle.is_timing());
    handle.shared().execute(TickMode::Full, &ctx, &live()).unwrap();
    assert!(handle.render_time() > std::time::Duration::ZERO);
    assert!(handle.render_rate() > 0.0);

    handle.disable_timing();
    assert!(!handle.is_timing());
}

#[test]
fn clear_and_resize_reset_surfaces() {
    let (handle, _) = recorder(2, 2);
    let ctx = HostContext::new(2, 2);
    handle.shared().execute(TickMode::Full, &ctx, &live()).unwrap();
    assert!(!handle.with_frame(|s| s.is_blank()));

    handle.shared().clear();
    assert!(handle.with_frame(|s| s.is_blank()));

    handle.shared().resize(5, 3);
    assert_eq!(handle.with_frame(|s| s.size()), (5, 3));
    handle.shared().execute(TickMode::Full, &ctx, &live()).unwrap();
    assert_eq!(handle.with_frame(|s| s.size()), (5, 3));
}

#[test]
fn compute_or_defer_runs_compute_only_when_idle() {
    let (handle, calls) = recorder(1, 1);
    let ran = handle
        .shared()
        .compute_or_defer(&HostContext::default())
        .unwrap();
    assert!(ran);
    assert_eq!(*calls.lock().unwrap(), vec!["compute"]);
}

/// Render blocks until released, so a test can observe a tick in flight.
struct Gated {
    calls: Arc<Mutex<Vec<&'static str>>>,
    started: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

impl Worker for Gated {
    fn compute(&mut self, _ctx: &HostContext) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push("compute");
        Ok(())
    }

    fn render(&mut self, _s: &mut PixelSurface, _ctx: &HostContext) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push("render");
        let _ = self.started.send(());
        let _ = self.release.recv_timeout(Duration::from_secs(5));
        Ok(())
    }
}

#[test]
fn compute_is_owed_while_a_tick_renders() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let handle: WorkerHandle = WorkerHandle::new(
        Gated {
            calls: Arc::clone(&calls),
            started: started_tx,
            release: release_rx,
        },
        1,
        1,
        false,
    );
    handle.shared().set_state(WorkerState::Running);

    let ticking = handle.clone();
    let tick = thread::spawn(move || {
        ticking
            .shared()
            .execute(TickMode::RenderOnly, &HostContext::default(), &live())
            .unwrap()
    });
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let began = Instant::now();
    let shared = handle.shared();
    assert!(!shared.compute_or_defer(&HostContext::default()).unwrap());
    assert!(!shared.compute_or_defer(&HostContext::default()).unwrap());
    assert!(began.elapsed() < Duration::from_millis(50));

    release_tx.send(()).unwrap();
    assert!(tick.join().unwrap());
    assert_eq!(*calls.lock().unwrap(), vec!["render"]);

    // the next tick pays back both computes before rendering
    release_tx.send(()).unwrap();
    handle
        .shared()
        .execute(TickMode::RenderOnly, &HostContext::default(), &live())
        .unwrap();
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["render", "compute", "compute", "render"]
    );
}

fn failing_render(delay: Duration) -> WorkerHandle {
    WorkerHandle::new(
        FnWorker(move |_s: &mut PixelSurface, _c: &HostContext| -> anyhow::Result<()> {
            thread::sleep(delay);
            anyhow::bail!("late failure")
        }),
        1,
        1,
        false,
    )
}

#[test]
fn failure_does_not_override_stopped_or_paused() {
    for state in [WorkerState::Stopped, WorkerState::Paused] {
        let handle = failing_render(Duration::ZERO);
        handle.shared().set_state(state);
        let ran = handle
            .shared()
            .execute(TickMode::Full, &HostContext::default(), &live())
            .unwrap();
        assert!(!ran);
        assert_eq!(handle.state(), state);
        assert!(handle.fault().is_none());
    }
}

#[test]
fn failure_after_cancel_is_not_reported() {
    let handle = failing_render(Duration::from_millis(50));
    handle.shared().set_state(WorkerState::Running);
    let cancelled = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&cancelled);
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        flag.store(true, std::sync::atomic::Ordering::Release);
    });
    let ran = handle
        .shared()
        .execute(TickMode::Full, &HostContext::default(), &cancelled)
        .unwrap();
    canceller.join().unwrap();

    assert!(!ran);
    assert_eq!(handle.state(), WorkerState::Running);
    assert!(handle.fault().is_none());
}

#[test]
fn resize_keeps_last_frame() {
    let (handle, _) = recorder(2, 2);
    let ctx = HostContext::new(2, 2);
    handle.shared().execute(TickMode::Full, &ctx, &live()).unwrap();

    handle.shared().resize(4, 3);
    handle.with_frame(|s| {
        assert_eq!(s.size(), (4, 3));
        assert_eq!(s.pixel(0, 0), Some(Rgba::WHITE));
        assert_eq!(s.pixel(3, 2), Some(Rgba::TRANSPARENT));
    });

    handle.shared().resize(1, 1);
    assert_eq!(handle.with_frame(|s| s.pixel(0, 0)), Some(Rgba::WHITE));
}
