// tests/scheduling.rs
//! Wall-clock scenarios. Bounds are loose so a busy CI machine still passes.

use sketch_threads::{
    FnWorker, HostContext, PixelSurface, Rgba, Scheduler, SchedulerConfig, Surface, Worker,
    WorkerState,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use test_log::test;

fn scheduler(width: u32, height: u32) -> Scheduler {
    let config = SchedulerConfig {
        pool_size: Some(4),
        ..SchedulerConfig::default()
    };
    Scheduler::new(config, width, height).unwrap()
}

fn counting_worker(counter: Arc<AtomicU64>) -> impl Worker {
    FnWorker(move |_s: &mut PixelSurface, _c: &HostContext| -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

#[test]
fn workers_tick_at_their_own_rates() {
    let mut s = scheduler(4, 4);
    let slow = Arc::new(AtomicU64::new(0));
    let fast = Arc::new(AtomicU64::new(0));
    s.spawn_worker(counting_worker(Arc::clone(&slow)), Some(30))
        .unwrap();
    s.spawn_worker(counting_worker(Arc::clone(&fast)), Some(60))
        .unwrap();

    thread::sleep(Duration::from_secs(2));
    s.stop_all();
    let (slow, fast) = (slow.load(Ordering::SeqCst), fast.load(Ordering::SeqCst));

    assert!((45..=62).contains(&slow), "30 FPS worker ticked {} times", slow);
    assert!((90..=122).contains(&fast), "60 FPS worker ticked {} times", fast);
}

#[test]
fn default_rate_applies_without_override() {
    let config = SchedulerConfig {
        default_fps: 20,
        pool_size: Some(2),
        ..SchedulerConfig::default()
    };
    let mut s: Scheduler = Scheduler::new(config, 4, 4).unwrap();
    let ticks = Arc::new(AtomicU64::new(0));
    let handle = s
        .spawn_worker(counting_worker(Arc::clone(&ticks)), None)
        .unwrap();
    assert_eq!(s.fps(handle.id()), Some(20));

    thread::sleep(Duration::from_secs(1));
    s.stop_all();
    let ticks = ticks.load(Ordering::SeqCst);
    assert!((14..=22).contains(&ticks), "20 FPS worker ticked {} times", ticks);
}

#[test]
fn resume_does_not_replay_missed_ticks() {
    let mut s = scheduler(4, 4);
    let ticks = Arc::new(AtomicU64::new(0));
    let handle = s
        .spawn_worker(counting_worker(Arc::clone(&ticks)), Some(100))
        .unwrap();
    thread::sleep(Duration::from_millis(200));

    s.pause(&[handle.id()]).wait();
    let paused_at = ticks.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(500));
    assert_eq!(ticks.load(Ordering::SeqCst), paused_at);

    s.resume(&[handle.id()]);
    thread::sleep(Duration::from_millis(100));
    let after = ticks.load(Ordering::SeqCst) - paused_at;
    // ~10 ticks in 100 ms; a replay of the pause would add ~50
    assert!((1..=15).contains(&after), "{} ticks right after resume", after);
}

#[test]
fn slow_worker_does_not_hold_back_fast_worker() {
    let mut s = scheduler(4, 4);
    let fast = Arc::new(AtomicU64::new(0));
    s.spawn_worker(
        FnWorker(|_s: &mut PixelSurface, _c: &HostContext| -> anyhow::Result<()> {
            thread::sleep(Duration::from_millis(200));
            Ok(())
        }),
        Some(60),
    )
    .unwrap();
    s.spawn_worker(counting_worker(Arc::clone(&fast)), Some(60))
        .unwrap();

    thread::sleep(Duration::from_secs(1));
    s.stop_all();
    let fast = fast.load(Ordering::SeqCst);
    assert!(fast >= 45, "fast worker ticked {} times", fast);
}

#[test]
fn pause_and_clear_leaves_a_blank_frame() {
    let mut s = scheduler(16, 16);
    let handle = s
        .spawn_worker(
            FnWorker(|surface: &mut PixelSurface, _c: &HostContext| -> anyhow::Result<()> {
                surface.fill(Rgba::WHITE);
                thread::sleep(Duration::from_millis(5));
                Ok(())
            }),
            Some(120),
        )
        .unwrap();
    thread::sleep(Duration::from_millis(100));

    s.pause_and_clear(&[handle.id()]);
    thread::sleep(Duration::from_millis(100));

    let mut output = PixelSurface::create(16, 16);
    assert_eq!(s.present(&mut output), 1);
    assert!(output.is_blank());
    assert_eq!(handle.state(), WorkerState::Paused);
}

#[test]
fn panicking_worker_is_isolated() {
    let mut s = scheduler(4, 4);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    s.set_error_handler(move |err| sink.lock().unwrap().push(err.to_string()));

    let healthy = Arc::new(AtomicU64::new(0));
    let broken = s
        .spawn_worker(
            FnWorker(|_s: &mut PixelSurface, _c: &HostContext| -> anyhow::Result<()> {
                panic!("divide by zero")
            }),
            Some(60),
        )
        .unwrap();
    s.spawn_worker(counting_worker(Arc::clone(&healthy)), Some(60))
        .unwrap();

    thread::sleep(Duration::from_millis(500));

    assert_eq!(broken.state(), WorkerState::Faulted);
    // the faulted worker's timer was cancelled after its first failure
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert!(healthy.load(Ordering::SeqCst) >= 20);
    assert!(s.is_running());
}

#[test]
fn presented_frames_are_never_torn() {
    const SIZE: u32 = 64;
    let mut s = scheduler(SIZE, SIZE);
    let flip = Arc::new(AtomicBool::new(false));
    let f = Arc::clone(&flip);
    s.spawn_worker(
        FnWorker(move |surface: &mut PixelSurface, _c: &HostContext| -> anyhow::Result<()> {
            let color = if f.fetch_xor(true, Ordering::SeqCst) {
                Rgba::rgb(255, 0, 0)
            } else {
                Rgba::rgb(0, 0, 255)
            };
            // row by row, so a reader in the middle would see both colors
            for y in 0..SIZE {
                surface.fill_rect(0, y as i32, SIZE, 1, color);
            }
            Ok(())
        }),
        Some(500),
    )
    .unwrap();

    let mut output = PixelSurface::create(SIZE, SIZE);
    let deadline = Instant::now() + Duration::from_millis(300);
    while Instant::now() < deadline {
        output.clear();
        s.present(&mut output);
        let first = output.pixel(0, 0);
        let last = output.pixel(SIZE - 1, SIZE - 1);
        assert_eq!(first, last, "output mixes two frames");
    }
}

/// Computes a counter, renders slowly.
struct HeavyRender {
    computes: Arc<AtomicU64>,
}

impl Worker for HeavyRender {
    fn compute(&mut self, _ctx: &HostContext) -> anyhow::Result<()> {
        self.computes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn render(&mut self, _s: &mut PixelSurface, _ctx: &HostContext) -> anyhow::Result<()> {
        thread::sleep(Duration::from_millis(100));
        Ok(())
    }
}

#[test]
fn decoupled_present_does_not_wait_for_render() {
    let mut s = scheduler(16, 16);
    s.unlink_compute_and_render();
    let computes = Arc::new(AtomicU64::new(0));
    s.spawn_worker(
        HeavyRender {
            computes: Arc::clone(&computes),
        },
        Some(60),
    )
    .unwrap();
    thread::sleep(Duration::from_millis(20));

    let mut output = PixelSurface::create(16, 16);
    let mut worst = Duration::ZERO;
    for _ in 0..10 {
        let began = Instant::now();
        s.present(&mut output);
        worst = worst.max(began.elapsed());
        thread::sleep(Duration::from_millis(16));
    }
    assert!(worst < Duration::from_millis(20), "present took {:?}", worst);

    // computes deferred during renders are paid back by later ticks
    thread::sleep(Duration::from_millis(250));
    assert!(computes.load(Ordering::SeqCst) >= 5);
}
