use tracing::warn;

use crate::constants::{CANVAS_HEIGHT, CANVAS_WIDTH, RGB_MASK};
use crate::render::RenderSurface;

/// Local authoritative cache of the canvas, written by optimistic local
/// updates and by inbound synchronization messages. Allocated once,
/// zero-initialized, never resized. Not internally synchronized: all
/// mutations must come from the single owning event loop.
pub struct PixelCanvas<S> {
    width: usize,
    height: usize,
    pixels: Vec<u32>,
    surface: S,
}

impl<S: RenderSurface> PixelCanvas<S> {
    pub fn new(surface: S) -> Self {
        Self::with_size(CANVAS_WIDTH, CANVAS_HEIGHT, surface)
    }

    pub fn with_size(width: usize, height: usize, surface: S) -> Self {
        PixelCanvas {
            width,
            height,
            pixels: vec![0; width * height],
            surface,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return None;
        }
        Some(y as usize * self.width + x as usize)
    }

    /// Write one cell and have the surface redraw it. Out-of-range calls are
    /// ignored so a draw loop can never crash on stray pointer math.
    pub fn set_local(&mut self, x: i32, y: i32, color: u32) {
        let Some(index) = self.index(x, y) else {
            return;
        };
        let color = color & RGB_MASK;
        self.pixels[index] = color;
        self.surface.draw_pixel(x as u16, y as u16, color);
    }

    /// Stored color, or the black sentinel for out-of-range coordinates.
    pub fn get_color(&self, x: i32, y: i32) -> u32 {
        match self.index(x, y) {
            Some(index) => self.pixels[index],
            None => 0,
        }
    }

    /// Full-snapshot replace on initial sync, followed by a full redraw. A
    /// snapshot with the wrong cell count is discarded; the buffer keeps its
    /// prior state.
    pub fn replace_all(&mut self, mut pixels: Vec<u32>) {
        if pixels.len() != self.width * self.height {
            warn!(
                got = pixels.len(),
                expected = self.width * self.height,
                "discarding snapshot with wrong pixel count"
            );
            return;
        }
        for pixel in &mut pixels {
            *pixel &= RGB_MASK;
        }
        self.pixels = pixels;
        self.surface
            .redraw_all(self.width, self.height, &self.pixels);
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }
}
