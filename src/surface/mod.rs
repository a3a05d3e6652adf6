// src/surface/mod.rs
//! Offscreen drawing surfaces.
//!
//! - `Surface`: the capabilities the scheduler needs from a host surface
//! - `PixelSurface`: software RGBA8 implementation
//! - `Rgba`: premultiplied color used by `PixelSurface`

pub mod pixel;

pub use pixel::{over, PixelSurface, Rgba};

/// A 2D pixel surface supplied by the host.
///
/// Each worker owns two surfaces created through [`Surface::create`]: one it
/// draws into and one that holds its last finished frame. The scheduler
/// copies finished frames onto the host output with [`Surface::draw_surface`].
pub trait Surface: Send + 'static {
    /// Allocates a blank surface of the given dimensions.
    fn create(width: u32, height: u32) -> Self
    where
        Self: Sized;

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// Opens a drawing scope. Called before a worker draws.
    fn begin_draw(&mut self) {}

    /// Closes the drawing scope opened by `begin_draw`.
    fn end_draw(&mut self) {}

    /// Makes every pixel fully transparent.
    fn clear(&mut self);

    /// Composites `src` onto this surface with its top-left corner at `(x, y)`.
    fn draw_surface(&mut self, src: &Self, x: i32, y: i32)
    where
        Self: Sized;

    fn size(&self) -> (u32, u32) {
        (self.width(), self.height())
    }
}
