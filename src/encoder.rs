use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::capture::Frame;

pub const FRAME_WIDTH: u32 = 320;
pub const FRAME_HEIGHT: u32 = 240;

const DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

#[derive(Debug, Clone, Copy)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    /// JPEG quality in `(0, 1]`.
    pub quality: f32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            quality: 0.5,
        }
    }
}

impl EncoderConfig {
    fn jpeg_quality(&self) -> u8 {
        (self.quality.clamp(0.01, 1.0) * 100.0).round().clamp(1.0, 100.0) as u8
    }
}

/// A mirrored, downsampled JPEG frame wrapped as a data URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data_uri: String,
    pub sequence: u64,
}

impl EncodedFrame {
    /// Decodes the payload again and reports its pixel dimensions.
    pub fn decode_dimensions(&self) -> anyhow::Result<(u32, u32)> {
        let encoded = self
            .data_uri
            .strip_prefix(DATA_URI_PREFIX)
            .context("payload is not a JPEG data URI")?;
        let bytes = BASE64_STANDARD
            .decode(encoded)
            .context("payload is not valid base64")?;
        let image = image::load_from_memory_with_format(&bytes, image::ImageFormat::Jpeg)
            .context("payload is not a decodable JPEG")?;
        Ok((image.width(), image.height()))
    }

    pub fn len(&self) -> usize {
        self.data_uri.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_uri.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct FrameEncoder {
    cfg: EncoderConfig,
}

impl FrameEncoder {
    pub fn new(cfg: EncoderConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.cfg
    }

    pub fn encode(&self, frame: &Frame) -> anyhow::Result<EncodedFrame> {
        let mirrored = self.mirrored_thumbnail(&frame.image);

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.cfg.jpeg_quality())
            .encode_image(&mirrored)
            .context("failed to JPEG-encode frame")?;

        let mut data_uri =
            String::with_capacity(DATA_URI_PREFIX.len() + jpeg.len().div_ceil(3) * 4);
        data_uri.push_str(DATA_URI_PREFIX);
        BASE64_STANDARD.encode_string(&jpeg, &mut data_uri);

        Ok(EncodedFrame {
            data_uri,
            sequence: frame.sequence,
        })
    }

    /// Resize to the encoder frame size, then flip horizontally.
    pub fn mirrored_thumbnail(&self, image: &RgbImage) -> RgbImage {
        let (width, height) = (self.cfg.width.max(1), self.cfg.height.max(1));
        if image.dimensions() == (width, height) {
            imageops::flip_horizontal(image)
        } else {
            let resized = imageops::resize(image, width, height, FilterType::Triangle);
            imageops::flip_horizontal(&resized)
        }
    }
}

/// The on-screen preview: the same horizontal flip as the transmitted frame,
/// kept at native resolution.
pub fn mirror_preview(frame: &Frame) -> RgbImage {
    imageops::flip_horizontal(&frame.image)
}
