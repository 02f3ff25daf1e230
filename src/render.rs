//! Overlay geometry and drawing.
//!
//! Detector coordinates live in the mirrored encoder frame (320x240 by
//! default). The overlay surface sits on top of the mirrored preview, so every
//! box is scaled to the surface and flipped across its vertical axis:
//!
//! ```text
//! left   = surface_w - x2 * sx      top    = y1 * sy
//! right  = surface_w - x1 * sx      bottom = y2 * sy
//! ```

use crate::detection::{BoundingBox, DetectionSet};

/// Vertical gap between a box's top edge and its label baseline.
pub const LABEL_OFFSET: f32 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl OverlayRect {
    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverlayBox {
    pub rect: OverlayRect,
    pub label: String,
    pub label_pos: (f32, f32),
}

/// Something the overlay can be drawn onto.
pub trait RenderSurface {
    /// Current size in surface units, or `None` while the surface is unavailable.
    fn size(&self) -> Option<(f32, f32)>;
    fn clear(&mut self);
    fn stroke_rect(&mut self, rect: OverlayRect);
    fn fill_text(&mut self, x: f32, y: f32, text: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// The surface was not available; nothing was drawn this tick.
    Skipped,
    Drawn(usize),
}

pub fn transform_box(
    b: &BoundingBox,
    surface: (f32, f32),
    frame: (f32, f32),
) -> OverlayRect {
    let (surface_w, surface_h) = surface;
    let scale_x = surface_w / frame.0;
    let scale_y = surface_h / frame.1;
    OverlayRect {
        left: surface_w - b.x2 * scale_x,
        right: surface_w - b.x1 * scale_x,
        top: b.y1 * scale_y,
        bottom: b.y2 * scale_y,
    }
}

pub fn layout(set: &DetectionSet, surface: (f32, f32), frame: (f32, f32)) -> Vec<OverlayBox> {
    set.boxes()
        .iter()
        .map(|b| {
            let rect = transform_box(b, surface, frame);
            OverlayBox {
                label: b.label(),
                label_pos: (rect.left, rect.top - LABEL_OFFSET),
                rect,
            }
        })
        .collect()
}

/// Draws a detection set onto a surface, replacing whatever was drawn before.
#[derive(Debug, Clone, Copy)]
pub struct OverlayRenderer {
    frame_w: f32,
    frame_h: f32,
}

impl OverlayRenderer {
    pub fn new(frame_width: u32, frame_height: u32) -> Self {
        Self {
            frame_w: frame_width.max(1) as f32,
            frame_h: frame_height.max(1) as f32,
        }
    }

    pub fn render(&self, surface: &mut dyn RenderSurface, set: &DetectionSet) -> RenderOutcome {
        let Some(size) = surface.size().filter(|(w, h)| *w > 0.0 && *h > 0.0) else {
            return RenderOutcome::Skipped;
        };

        surface.clear();
        let boxes = layout(set, size, (self.frame_w, self.frame_h));
        for overlay in &boxes {
            surface.stroke_rect(overlay.rect);
            surface.fill_text(overlay.label_pos.0, overlay.label_pos.1, &overlay.label);
        }
        RenderOutcome::Drawn(boxes.len())
    }
}

/// Headless surface: logs what would be drawn.
#[derive(Debug, Clone)]
pub struct TraceSurface {
    pub width: f32,
    pub height: f32,
}

impl RenderSurface for TraceSurface {
    fn size(&self) -> Option<(f32, f32)> {
        Some((self.width, self.height))
    }

    fn clear(&mut self) {}

    fn stroke_rect(&mut self, rect: OverlayRect) {
        tracing::trace!(
            "rect [{:.1}, {:.1}] - [{:.1}, {:.1}]",
            rect.left,
            rect.top,
            rect.right,
            rect.bottom
        );
    }

    fn fill_text(&mut self, x: f32, y: f32, text: &str) {
        tracing::trace!("label {text:?} at ({x:.1}, {y:.1})");
    }
}
