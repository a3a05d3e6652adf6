// src/config.rs

//! Configuration structures for the scheduler and the host loop.
//!
//! Every section can be deserialized from JSON. Missing fields fall back to
//! their defaults, so an empty object is a valid configuration.

use crate::error::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fallback target rate for workers added without an explicit FPS.
pub const DEFAULT_FPS: u32 = 60;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Worker scheduling settings.
    pub scheduler: SchedulerConfig,
    /// Host display and frame pacing settings.
    pub host: HostConfig,
}

impl Config {
    /// Parses a configuration from a JSON document.
    pub fn from_json_str(json: &str) -> SchedulerResult<Self> {
        serde_json::from_str(json).map_err(|e| SchedulerError::config(e.to_string()))
    }

    /// Reads and parses a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> SchedulerResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SchedulerError::config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }
}

// --- Scheduler Configuration ---

/// Settings for the worker scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Target frames per second for workers added without a per-worker rate.
    pub default_fps: u32,
    /// Number of execution slots (pool threads).
    /// `None` sizes the pool to the machine's available parallelism.
    pub pool_size: Option<usize>,
    /// Pool threads are named "{prefix}-{index}".
    pub thread_name_prefix: String,
    /// Start with compute driven by `present()` instead of by worker ticks.
    pub decoupled: bool,
    /// Collect compute/render timings for newly created workers.
    pub timing: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            default_fps: DEFAULT_FPS,
            pool_size: None,
            thread_name_prefix: "sketch-worker".to_string(),
            decoupled: false,
            timing: false,
        }
    }
}

impl SchedulerConfig {
    /// Resolved number of pool threads (always at least one).
    pub fn effective_pool_size(&self) -> usize {
        match self.pool_size {
            Some(n) => n.max(1),
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }

    pub(crate) fn validate(&self) -> SchedulerResult<()> {
        if self.default_fps == 0 {
            return Err(SchedulerError::invalid_argument(
                "default_fps must be greater than 0",
            ));
        }
        Ok(())
    }
}

// --- Host Configuration ---

/// Settings for the host display and its frame loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostConfig {
    /// Display width in pixels.
    pub width: u32,
    /// Display height in pixels.
    pub height: u32,
    /// Host frame rate; `present()` runs once per host frame.
    pub fps: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            width: 640,
            height: 360,
            fps: 60,
        }
    }
}
