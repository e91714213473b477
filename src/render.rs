use tracing::{debug, trace};

use crate::constants::{INITIAL_SCALE, MAX_SCALE, MIN_SCALE};

/// Boundary to the external display surface. Implementations translate cell
/// updates into actual draws and must not block the caller; the sync core
/// never reads anything back from the surface.
pub trait RenderSurface {
    /// One cell changed.
    fn draw_pixel(&mut self, x: u16, y: u16, color: u32);

    /// The whole buffer was replaced, row-major.
    fn redraw_all(&mut self, width: usize, height: usize, pixels: &[u32]);

    /// The pan/zoom transform changed.
    fn set_view(&mut self, view: &ViewTransform);
}

/// Logical pan/zoom state, translated by the surface into a visual transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewTransform {
    pub scale: f32,
    pub offset_x: f32,
    pub offset_y: f32,
}

impl Default for ViewTransform {
    fn default() -> Self {
        ViewTransform {
            scale: INITIAL_SCALE,
            offset_x: 0.0,
            offset_y: 0.0,
        }
    }
}

impl ViewTransform {
    /// Returns the transform with the scale clamped to the allowed zoom range.
    pub fn zoomed(self, scale: f32) -> Self {
        ViewTransform {
            scale: scale.clamp(MIN_SCALE, MAX_SCALE),
            ..self
        }
    }

    /// Transform that centers a `canvas_width` x `canvas_height` canvas at the
    /// given scale inside a container of the given pixel size.
    pub fn centered(
        canvas_width: usize,
        canvas_height: usize,
        container_width: f32,
        container_height: f32,
        scale: f32,
    ) -> Self {
        let scale = scale.clamp(MIN_SCALE, MAX_SCALE);
        let scaled_width = canvas_width as f32 * scale;
        let scaled_height = canvas_height as f32 * scale;
        ViewTransform {
            scale,
            offset_x: (container_width - scaled_width) / 2.0,
            offset_y: (container_height - scaled_height) / 2.0,
        }
    }

    /// Back to the initial zoom, centered.
    pub fn reset(
        canvas_width: usize,
        canvas_height: usize,
        container_width: f32,
        container_height: f32,
    ) -> Self {
        Self::centered(
            canvas_width,
            canvas_height,
            container_width,
            container_height,
            INITIAL_SCALE,
        )
    }
}

/// Surface for headless runs: draws become log lines.
#[derive(Debug, Default)]
pub struct TraceSurface;

impl RenderSurface for TraceSurface {
    fn draw_pixel(&mut self, x: u16, y: u16, color: u32) {
        trace!(x, y, color, "draw pixel");
    }

    fn redraw_all(&mut self, width: usize, height: usize, _pixels: &[u32]) {
        debug!(width, height, "full redraw");
    }

    fn set_view(&mut self, view: &ViewTransform) {
        debug!(?view, "view changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zoom_is_clamped() {
        let view = ViewTransform::default();
        assert_eq!(view.zoomed(0.01).scale, MIN_SCALE);
        assert_eq!(view.zoomed(100.0).scale, MAX_SCALE);
        assert_eq!(view.zoomed(2.0).scale, 2.0);
    }

    #[test]
    fn centering_splits_leftover_space() {
        // 1024 * 0.75 = 768 wide in a 1000x500 container
        let view = ViewTransform::centered(1024, 1024, 1000.0, 500.0, 0.75);
        assert_eq!(view.offset_x, (1000.0 - 768.0) / 2.0);
        assert_eq!(view.offset_y, (500.0 - 768.0) / 2.0);
    }

    #[test]
    fn reset_restores_initial_scale() {
        let view = ViewTransform::default().zoomed(4.0);
        assert_ne!(view.scale, INITIAL_SCALE);
        let reset = ViewTransform::reset(1024, 1024, 800.0, 600.0);
        assert_eq!(reset.scale, INITIAL_SCALE);
        assert_eq!(reset, ViewTransform::centered(1024, 1024, 800.0, 600.0, INITIAL_SCALE));
    }
}
