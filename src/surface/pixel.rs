// src/surface/pixel.rs
//! Software RGBA8 surface.
//!
//! Pixels are stored premultiplied, row-major, four bytes per pixel in a
//! single boxed slice.

use crate::surface::Surface;
use log::trace;
use serde::{Deserialize, Serialize};

const BYTES_PER_PIXEL: usize = 4;

/// Premultiplied RGBA8 color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rgba(pub [u8; 4]);

impl Rgba {
    pub const TRANSPARENT: Rgba = Rgba([0, 0, 0, 0]);
    pub const BLACK: Rgba = Rgba([0, 0, 0, 255]);
    pub const WHITE: Rgba = Rgba([255, 255, 255, 255]);

    /// Opaque color from 8-bit channels.
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Rgba([r, g, b, 255])
    }

    /// Premultiplies straight-alpha channels.
    pub fn from_rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        let a16 = u16::from(a);
        Rgba([
            mul_div255(u16::from(r), a16),
            mul_div255(u16::from(g), a16),
            mul_div255(u16::from(b), a16),
            a,
        ])
    }

    pub fn alpha(self) -> u8 {
        self.0[3]
    }
}

/// Source-over compositing of premultiplied colors.
pub fn over(dst: Rgba, src: Rgba) -> Rgba {
    let sa = src.0[3];
    if sa == 0 {
        return dst;
    }
    if sa == 255 {
        return src;
    }
    let inv = 255u16 - u16::from(sa);
    let mut out = src.0;
    for (o, d) in out.iter_mut().zip(dst.0) {
        *o = o.saturating_add(mul_div255(u16::from(d), inv));
    }
    Rgba(out)
}

fn mul_div255(x: u16, y: u16) -> u8 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u8
}

/// CPU framebuffer implementing [`Surface`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelSurface {
    width: u32,
    height: u32,
    pixels: Box<[u8]>,
    drawing: bool,
}

impl PixelSurface {
    pub fn new(width: u32, height: u32) -> Self {
        let len = width as usize * height as usize * BYTES_PER_PIXEL;
        Self {
            width,
            height,
            pixels: vec![0u8; len].into_boxed_slice(),
            drawing: false,
        }
    }

    /// Raw premultiplied RGBA8 bytes.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// True while between `begin_draw` and `end_draw`.
    pub fn is_drawing(&self) -> bool {
        self.drawing
    }

    fn offset(&self, x: u32, y: u32) -> Option<usize> {
        if x < self.width && y < self.height {
            Some((y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL)
        } else {
            None
        }
    }

    /// Color at `(x, y)`, or `None` outside the surface.
    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgba> {
        let i = self.offset(x, y)?;
        let p = &self.pixels[i..i + BYTES_PER_PIXEL];
        Some(Rgba([p[0], p[1], p[2], p[3]]))
    }

    /// Overwrites one pixel. Out-of-bounds writes are ignored.
    pub fn set_pixel(&mut self, x: u32, y: u32, color: Rgba) {
        if let Some(i) = self.offset(x, y) {
            self.pixels[i..i + BYTES_PER_PIXEL].copy_from_slice(&color.0);
        }
    }

    /// Overwrites every pixel with `color`.
    pub fn fill(&mut self, color: Rgba) {
        for px in self.pixels.chunks_exact_mut(BYTES_PER_PIXEL) {
            px.copy_from_slice(&color.0);
        }
    }

    /// Blends a rectangle over the surface, clipped to its bounds.
    pub fn fill_rect(&mut self, x: i32, y: i32, w: u32, h: u32, color: Rgba) {
        let Some((x0, x1)) = clip_span(x, w, self.width) else {
            return;
        };
        let Some((y0, y1)) = clip_span(y, h, self.height) else {
            return;
        };
        let stride = self.width as usize * BYTES_PER_PIXEL;
        for row in y0..y1 {
            let start = row * stride + x0 * BYTES_PER_PIXEL;
            let end = row * stride + x1 * BYTES_PER_PIXEL;
            for px in self.pixels[start..end].chunks_exact_mut(BYTES_PER_PIXEL) {
                let out = over(Rgba([px[0], px[1], px[2], px[3]]), color);
                px.copy_from_slice(&out.0);
            }
        }
    }

    /// True if every pixel is fully transparent.
    pub fn is_blank(&self) -> bool {
        self.pixels.iter().all(|&b| b == 0)
    }
}

/// Intersects `[start, start + len)` with `[0, limit)`.
fn clip_span(start: i32, len: u32, limit: u32) -> Option<(usize, usize)> {
    let lo = i64::from(start).max(0);
    let hi = (i64::from(start) + i64::from(len)).min(i64::from(limit));
    if lo >= hi {
        None
    } else {
        Some((lo as usize, hi as usize))
    }
}

impl Surface for PixelSurface {
    fn create(width: u32, height: u32) -> Self {
        PixelSurface::new(width, height)
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn begin_draw(&mut self) {
        self.drawing = true;
    }

    fn end_draw(&mut self) {
        self.drawing = false;
    }

    fn clear(&mut self) {
        self.pixels.fill(0);
    }

    fn draw_surface(&mut self, src: &PixelSurface, x: i32, y: i32) {
        let Some((dx0, dx1)) = clip_span(x, src.width, self.width) else {
            return;
        };
        let Some((dy0, dy1)) = clip_span(y, src.height, self.height) else {
            return;
        };
        trace!(
            "PixelSurface: draw {}x{} at ({}, {})",
            src.width,
            src.height,
            x,
            y
        );
        let dst_stride = self.width as usize * BYTES_PER_PIXEL;
        let src_stride = src.width as usize * BYTES_PER_PIXEL;
        let sx0 = (dx0 as i64 - i64::from(x)) as usize;
        let span = (dx1 - dx0) * BYTES_PER_PIXEL;
        for dy in dy0..dy1 {
            let sy = (dy as i64 - i64::from(y)) as usize;
            let d = dy * dst_stride + dx0 * BYTES_PER_PIXEL;
            let s = sy * src_stride + sx0 * BYTES_PER_PIXEL;
            let dst_row = &mut self.pixels[d..d + span];
            let src_row = &src.pixels[s..s + span];
            for (dp, sp) in dst_row
                .chunks_exact_mut(BYTES_PER_PIXEL)
                .zip(src_row.chunks_exact(BYTES_PER_PIXEL))
            {
                let out = over(
                    Rgba([dp[0], dp[1], dp[2], dp[3]]),
                    Rgba([sp[0], sp[1], sp[2], sp[3]]),
                );
                dp.copy_from_slice(&out.0);
            }
        }
    }
}
