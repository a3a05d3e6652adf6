// src/scheduler/mod.rs
//! Fixed-rate multi-worker scheduling.
//!
//! - `pool`: execution slots (named threads) that run ticks
//! - `timer`: dispatcher thread with per-worker fixed-rate timers
//! - `manager`: the `Scheduler` that ties workers, timers and `present` together
//!
//! ```text
//!   host thread                 sketch-timer              sketch-worker-N
//!   ───────────                 ────────────              ───────────────
//!   add_worker ──schedule──►  deadline heap ──submit──►  execute(tick)
//!   pause/resume/stop ─cancel─►  (drops cancelled)          back buffer
//!   present ◄────────────── front buffers ◄──── swap ──────┘
//! ```

pub mod manager;
pub(crate) mod pool;
pub mod timer;

pub use manager::{PauseToken, Scheduler};
pub use timer::TimerHandle;
