// src/scheduler/timer.rs
//! Fixed-rate recurring timers.
//!
//! A single dispatcher thread keeps a deadline heap of every live timer and
//! submits due ticks to the [`ExecutionPool`]. Deadlines are computed from
//! each timer's start instant (`start + k * period`), so a late tick never
//! pushes later ones back. When a tick overruns, the slots it missed are
//! dropped rather than replayed.
//!
//! A tick is not submitted while the previous tick of the same timer is
//! still queued or running, so one timer never executes concurrently with
//! itself.

use crate::error::SchedulerResult;
use crate::scheduler::pool::ExecutionPool;
use log::*;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Work run on every tick. Receives its own timer so it can cancel itself.
pub(crate) type Task = Arc<dyn Fn(&TimerHandle) + Send + Sync + 'static>;

#[derive(Debug, Default)]
struct TimerState {
    cancelled: AtomicBool,
    in_flight: AtomicBool,
    fired: AtomicU64,
}

/// Cancellable token for one recurring schedule.
///
/// Cancelling never blocks; a tick that already started runs to completion.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    state: Arc<TimerState>,
    period: Duration,
}

impl TimerHandle {
    pub(crate) fn new(period: Duration) -> Self {
        Self {
            state: Arc::new(TimerState::default()),
            period,
        }
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of ticks submitted to the pool so far.
    pub fn fired(&self) -> u64 {
        self.state.fired.load(Ordering::Relaxed)
    }

    pub(crate) fn cancelled_flag(&self) -> &AtomicBool {
        &self.state.cancelled
    }
}

/// Period for a target rate, in whole microseconds.
pub(crate) fn period_for_fps(fps: u32) -> Duration {
    Duration::from_micros(1_000_000 / u64::from(fps.max(1)))
}

struct Entry {
    deadline: Instant,
    start: Instant,
    handle: TimerHandle,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // reversed: BinaryHeap is a max-heap, the earliest deadline must pop first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.deadline.cmp(&self.deadline)
    }
}

impl Entry {
    /// First slot strictly after `now`.
    fn advance(&mut self, now: Instant) {
        let period = self.handle.period.max(Duration::from_nanos(1));
        let elapsed = now.saturating_duration_since(self.start);
        let slots = elapsed.as_nanos() / period.as_nanos() + 1;
        let offset = period.as_nanos().saturating_mul(slots);
        self.deadline = self.start + Duration::from_nanos(offset.min(u128::from(u64::MAX)) as u64);
    }
}

enum Command {
    Schedule(Entry),
    Shutdown,
}

/// Clears the in-flight flag when a tick ends, even by panic.
struct InFlightGuard(Arc<TimerState>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

pub(crate) struct Dispatcher {
    cmd_tx: Sender<Command>,
    thread: Option<JoinHandle<()>>,
    pool: Arc<ExecutionPool>,
}

impl Dispatcher {
    pub(crate) fn spawn(pool: ExecutionPool) -> SchedulerResult<Self> {
        let pool = Arc::new(pool);
        let (cmd_tx, cmd_rx) = channel();
        let loop_pool = Arc::clone(&pool);
        let thread = thread::Builder::new()
            .name("sketch-timer".to_string())
            .spawn(move || Self::run(cmd_rx, loop_pool))?;
        info!("Dispatcher: started");
        Ok(Self {
            cmd_tx,
            thread: Some(thread),
            pool,
        })
    }

    pub(crate) fn pool_size(&self) -> usize {
        self.pool.size()
    }

    /// Starts a recurring schedule. The first tick is due immediately.
    pub(crate) fn schedule(&self, period: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new(period);
        let now = Instant::now();
        let entry = Entry {
            deadline: now,
            start: now,
            handle: handle.clone(),
            task,
        };
        if self.cmd_tx.send(Command::Schedule(entry)).is_err() {
            warn!("Dispatcher: schedule after shutdown, timer is inert");
            handle.cancel();
        }
        handle
    }

    fn run(cmd_rx: Receiver<Command>, pool: Arc<ExecutionPool>) {
        let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
        loop {
            let command = match heap.peek() {
                Some(next) => {
                    let wait = next.deadline.saturating_duration_since(Instant::now());
                    cmd_rx.recv_timeout(wait)
                }
                None => cmd_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match command {
                Ok(Command::Schedule(entry)) => heap.push(entry),
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            Self::fire_due(&mut heap, &pool);
        }
        debug!("Dispatcher: exiting with {} timers pending", heap.len());
    }

    fn fire_due(heap: &mut BinaryHeap<Entry>, pool: &ExecutionPool) {
        let now = Instant::now();
        while heap.peek().is_some_and(|e| e.deadline <= now) {
            let Some(mut entry) = heap.pop() else {
                break;
            };
            if entry.handle.is_cancelled() {
                trace!("Dispatcher: dropping cancelled timer");
                continue;
            }
            let state = Arc::clone(&entry.handle.state);
            if state.in_flight.swap(true, Ordering::AcqRel) {
                trace!("Dispatcher: previous tick still running, slot skipped");
            } else {
                state.fired.fetch_add(1, Ordering::Relaxed);
                let task = Arc::clone(&entry.task);
                let handle = entry.handle.clone();
                let submitted = pool.submit(Box::new(move || {
                    let _guard = InFlightGuard(state);
                    task(&handle);
                }));
                if !submitted {
                    warn!("Dispatcher: pool closed, cancelling timer");
                    entry.handle.cancel();
                    continue;
                }
            }
            entry.advance(now);
            heap.push(entry);
        }
    }

    /// Stops the timer thread, then drains and joins the pool.
    pub(crate) fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Err(e) = thread.join() {
            error!("Dispatcher: timer thread panicked: {:?}", e);
        }
        match Arc::get_mut(&mut self.pool) {
            Some(pool) => pool.shutdown(),
            None => warn!("Dispatcher: pool still shared, slots released on drop"),
        }
        info!("Dispatcher: shut down");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
