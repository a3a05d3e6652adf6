// src/lib.rs
//! sketch-threads: run many independent drawing workers at their own frame
//! rates on a shared thread pool, and composite their offscreen surfaces
//! onto one output once per host frame.

pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod scheduler;
pub mod surface;
pub mod worker;

pub use config::{Config, HostConfig, SchedulerConfig, DEFAULT_FPS};
pub use context::HostContext;
pub use error::{Phase, SchedulerError, SchedulerResult};
pub use host::{HostLoop, Sketch};
pub use scheduler::{PauseToken, Scheduler, TimerHandle};
pub use surface::{PixelSurface, Rgba, Surface};
pub use worker::{FnWorker, Worker, WorkerFault, WorkerHandle, WorkerId, WorkerState};
