use anyhow::Context;
use image::RgbImage;
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::FourCC;

use super::{CaptureConfig, CaptureError, CaptureShared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelLayout {
    Rgb3,
    Yuyv,
    Mjpg,
}

impl PixelLayout {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"RGB3" => Some(Self::Rgb3),
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpg),
            _ => None,
        }
    }
}

pub(super) struct V4l2Camera {
    path: String,
    device: v4l::Device,
    width: u32,
    height: u32,
    layout: PixelLayout,
}

impl V4l2Camera {
    pub(super) fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let path = config.device.as_str();
        let device =
            v4l::Device::with_path(path).map_err(|err| CaptureError::from_io(path, err))?;

        let mut format = device
            .format()
            .map_err(|err| CaptureError::from_io(path, err))?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                tracing::warn!("failed to set RGB3 format on {path}: {err}");
                device
                    .format()
                    .map_err(|err| CaptureError::from_io(path, err))?
            }
        };

        let layout = PixelLayout::from_fourcc(format.fourcc).ok_or_else(|| {
            CaptureError::Format(format!("{path} negotiated unsupported format {}", format.fourcc))
        })?;

        if config.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.fps);
            if let Err(err) = device.set_params(&params) {
                tracing::warn!("failed to set {} fps on {path}: {err}", config.fps);
            }
        }

        tracing::info!(
            "opened {path} at {}x{} ({:?})",
            format.width,
            format.height,
            layout
        );

        Ok(Self {
            path: path.to_string(),
            device,
            width: format.width,
            height: format.height,
            layout,
        })
    }

    pub(super) fn run(mut self, shared: &CaptureShared) -> anyhow::Result<()> {
        let mut stream =
            v4l::prelude::MmapStream::with_buffers(&mut self.device, Type::VideoCapture, 4)
                .with_context(|| format!("create buffer stream for {}", self.path))?;

        while !shared.should_stop() {
            let (buf, _meta) = stream
                .next()
                .with_context(|| format!("capture frame from {}", self.path))?;
            let image = match self.layout {
                PixelLayout::Rgb3 => rgb3_to_image(buf, self.width, self.height)?,
                PixelLayout::Yuyv => yuyv_to_image(buf, self.width, self.height)?,
                PixelLayout::Mjpg => image::load_from_memory_with_format(
                    buf,
                    image::ImageFormat::Jpeg,
                )
                .context("decode MJPG frame")?
                .to_rgb8(),
            };
            shared.push(image);
        }
        Ok(())
    }
}

fn rgb3_to_image(buf: &[u8], width: u32, height: u32) -> anyhow::Result<RgbImage> {
    let len = (width * height * 3) as usize;
    anyhow::ensure!(buf.len() >= len, "short RGB3 buffer ({} < {len})", buf.len());
    RgbImage::from_raw(width, height, buf[..len].to_vec()).context("RGB3 buffer size mismatch")
}

fn yuyv_to_image(buf: &[u8], width: u32, height: u32) -> anyhow::Result<RgbImage> {
    let len = (width * height * 2) as usize;
    anyhow::ensure!(buf.len() >= len, "short YUYV buffer ({} < {len})", buf.len());

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in buf[..len].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    RgbImage::from_raw(width, height, rgb).context("YUYV buffer size mismatch")
}

// BT.601 limited range.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = f32::from(y) - 16.0;
    let d = f32::from(u) - 128.0;
    let e = f32::from(v) - 128.0;
    let r = 1.164 * c + 1.596 * e;
    let g = 1.164 * c - 0.392 * d - 0.813 * e;
    let b = 1.164 * c + 2.017 * d;
    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}
