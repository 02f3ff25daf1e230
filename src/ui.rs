use eframe::egui;

use crate::app::Session;
use crate::channel::ChannelStatus;
use crate::encoder::mirror_preview;
use crate::render::{OverlayRect, RenderSurface};

const BOX_COLOR: egui::Color32 = egui::Color32::RED;
const BOX_STROKE: f32 = 2.0;
const LABEL_FONT_SIZE: f32 = 16.0;

pub fn run_overlay(session: Session, width: f32, height: f32) -> anyhow::Result<()> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title("Annotator")
            .with_resizable(true)
            .with_inner_size([width.max(160.0), height.max(120.0)]),
        ..Default::default()
    };

    let app = OverlayApp {
        session,
        preview: None,
        preview_sequence: 0,
        show_status: true,
    };

    eframe::run_native(
        "Annotator",
        options,
        Box::new(move |_cc| Ok(Box::new(app))),
    )
    .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

struct OverlayApp {
    session: Session,
    preview: Option<egui::TextureHandle>,
    preview_sequence: u64,
    show_status: bool,
}

/// Draws overlay shapes relative to the preview rectangle.
struct PainterSurface<'a> {
    painter: &'a egui::Painter,
    rect: egui::Rect,
}

impl RenderSurface for PainterSurface<'_> {
    fn size(&self) -> Option<(f32, f32)> {
        let size = self.rect.size();
        (size.x >= 1.0 && size.y >= 1.0).then_some((size.x, size.y))
    }

    // egui repaints the whole frame every update, so there is nothing to erase.
    fn clear(&mut self) {}

    fn stroke_rect(&mut self, rect: OverlayRect) {
        let origin = self.rect.min;
        let shape = egui::Rect::from_two_pos(
            origin + egui::vec2(rect.left, rect.top),
            origin + egui::vec2(rect.right, rect.bottom),
        );
        self.painter
            .rect_stroke(shape, 0.0, egui::Stroke::new(BOX_STROKE, BOX_COLOR));
    }

    fn fill_text(&mut self, x: f32, y: f32, text: &str) {
        self.painter.text(
            self.rect.min + egui::vec2(x, y),
            egui::Align2::LEFT_BOTTOM,
            text,
            egui::FontId::proportional(LABEL_FONT_SIZE),
            BOX_COLOR,
        );
    }
}

impl eframe::App for OverlayApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if ctx.input(|i| i.key_pressed(egui::Key::Escape)) {
            self.session.stop();
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
            return;
        }

        if ctx.input(|i| i.key_pressed(egui::Key::S)) {
            self.show_status = !self.show_status;
        }

        // Every repaint is one capture/transmit/render tick.
        ctx.request_repaint();
        self.refresh_preview(ctx);

        egui::CentralPanel::default()
            .frame(egui::Frame::none().fill(egui::Color32::BLACK))
            .show(ctx, |ui| {
                let rect = ui.available_rect_before_wrap();
                let painter = ui.painter_at(rect);

                if let Some(texture) = &self.preview {
                    painter.image(
                        texture.id(),
                        rect,
                        egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0)),
                        egui::Color32::WHITE,
                    );
                }

                let mut surface = PainterSurface {
                    painter: &painter,
                    rect,
                };
                self.session.tick(&mut surface);

                if self.show_status {
                    self.draw_status(&painter, rect);
                }
            });
    }
}

impl OverlayApp {
    fn refresh_preview(&mut self, ctx: &egui::Context) {
        let Some(frame) = self.session.latest_frame() else {
            return;
        };
        if frame.sequence == self.preview_sequence {
            return;
        }
        self.preview_sequence = frame.sequence;

        let mirrored = mirror_preview(&frame);
        let image = egui::ColorImage::from_rgb(
            [mirrored.width() as usize, mirrored.height() as usize],
            mirrored.as_raw(),
        );
        match &mut self.preview {
            Some(texture) => texture.set(image, egui::TextureOptions::LINEAR),
            None => {
                self.preview =
                    Some(ctx.load_texture("camera-preview", image, egui::TextureOptions::LINEAR));
            }
        }
    }

    fn draw_status(&self, painter: &egui::Painter, rect: egui::Rect) {
        let status = match self.session.channel_status() {
            ChannelStatus::Connecting => "connecting",
            ChannelStatus::Open => "connected",
            ChannelStatus::Closed => "disconnected",
        };
        let camera = if self.session.camera_healthy() {
            "camera ok"
        } else {
            "camera lost"
        };
        let boxes = self.session.detections().len();
        let alert = self.session.last_alert().unwrap_or_default();
        let text =
            format!("{camera} • {status} • {boxes} boxes • {alert}    S: status • Esc: quit");

        let bar = egui::Rect::from_min_size(rect.min, egui::vec2(rect.width(), 22.0));
        painter.rect_filled(
            bar,
            0.0,
            egui::Color32::from_rgba_unmultiplied(0, 0, 0, 120),
        );
        painter.text(
            bar.left_center() + egui::vec2(8.0, 0.0),
            egui::Align2::LEFT_CENTER,
            text,
            egui::FontId::proportional(13.0),
            egui::Color32::from_rgba_unmultiplied(255, 255, 255, 230),
        );
    }
}
