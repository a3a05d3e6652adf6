// src/context.rs

//! Read-only host state handed to workers.

use serde::{Deserialize, Serialize};

/// Snapshot of the host fields a worker may read.
///
/// The host refreshes it once per frame (see `Scheduler::set_context`);
/// every tick sees a consistent copy.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HostContext {
    /// Display width in pixels.
    pub width: u32,
    /// Display height in pixels.
    pub height: u32,
    /// Number of host frames presented so far.
    pub frame_count: u64,
    pub pointer_x: f32,
    pub pointer_y: f32,
    pub pointer_pressed: bool,
}

impl HostContext {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }
}
