use std::time::Duration;

use image::{Rgb, RgbImage};

use super::{CaptureConfig, CaptureError, CaptureShared};

/// Test pattern produced by a `stub://` source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticPattern {
    Black,
    /// Horizontal gradient that drifts one column per frame.
    Gradient,
}

impl SyntheticPattern {
    pub fn parse(name: &str) -> Result<Self, CaptureError> {
        match name {
            "" | "black" => Ok(Self::Black),
            "gradient" => Ok(Self::Gradient),
            other => Err(CaptureError::Unsupported(format!(
                "unknown synthetic pattern `{other}` (expected `black` or `gradient`)"
            ))),
        }
    }
}

/// Parses the part of a `stub://` device after the scheme.
///
/// `<pattern>?frames=N` makes the stream fail after `N` frames, the way an
/// unplugged camera would.
pub(super) fn parse_stub(spec: &str) -> Result<(SyntheticPattern, Option<u64>), CaptureError> {
    let (name, query) = match spec.split_once('?') {
        Some((name, query)) => (name, Some(query)),
        None => (spec, None),
    };
    let pattern = SyntheticPattern::parse(name)?;
    let limit = match query {
        None => None,
        Some(query) => {
            let count = query
                .strip_prefix("frames=")
                .and_then(|n| n.parse::<u64>().ok())
                .ok_or_else(|| {
                    CaptureError::Unsupported(format!(
                        "bad synthetic option `{query}` (expected `frames=N`)"
                    ))
                })?;
            Some(count)
        }
    };
    Ok((pattern, limit))
}

pub(super) struct SyntheticCamera {
    pattern: SyntheticPattern,
    width: u32,
    height: u32,
    interval: Duration,
    frame_count: u64,
    frame_limit: Option<u64>,
}

impl SyntheticCamera {
    pub(super) fn new(pattern: SyntheticPattern, config: &CaptureConfig) -> Self {
        Self {
            pattern,
            width: config.width.max(1),
            height: config.height.max(1),
            interval: Duration::from_millis(1000 / u64::from(config.fps.max(1))),
            frame_count: 0,
            frame_limit: None,
        }
    }

    pub(super) fn with_frame_limit(mut self, limit: Option<u64>) -> Self {
        self.frame_limit = limit;
        self
    }

    pub(super) fn run(mut self, shared: &CaptureShared) -> anyhow::Result<()> {
        tracing::debug!(
            "synthetic camera {:?} running at {}x{}",
            self.pattern,
            self.width,
            self.height
        );
        while !shared.should_stop() {
            if let Some(limit) = self.frame_limit.filter(|&l| self.frame_count >= l) {
                anyhow::bail!("synthetic stream ended after {limit} frames");
            }
            shared.push(self.next_image());
            std::thread::sleep(self.interval);
        }
        Ok(())
    }

    fn next_image(&mut self) -> RgbImage {
        self.frame_count += 1;
        match self.pattern {
            SyntheticPattern::Black => RgbImage::new(self.width, self.height),
            SyntheticPattern::Gradient => {
                let width = self.width;
                let shift = self.frame_count as u32;
                RgbImage::from_fn(width, self.height, |x, y| {
                    let v = (((x + shift) % width) * 255 / width.max(1)) as u8;
                    Rgb([v, (y % 256) as u8, 255 - v])
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_patterns() {
        assert_eq!(SyntheticPattern::parse("black").unwrap(), SyntheticPattern::Black);
        assert_eq!(SyntheticPattern::parse("").unwrap(), SyntheticPattern::Black);
        assert_eq!(
            SyntheticPattern::parse("gradient").unwrap(),
            SyntheticPattern::Gradient
        );
    }

    #[test]
    fn stub_options_set_a_frame_limit() {
        assert_eq!(parse_stub("gradient").unwrap(), (SyntheticPattern::Gradient, None));
        assert_eq!(
            parse_stub("black?frames=3").unwrap(),
            (SyntheticPattern::Black, Some(3))
        );
        assert!(matches!(
            parse_stub("black?fps=3"),
            Err(CaptureError::Unsupported(_))
        ));
    }

    #[test]
    fn gradient_drifts_between_frames() {
        let config = CaptureConfig {
            device: "stub://gradient".into(),
            width: 16,
            height: 4,
            fps: 30,
        };
        let mut camera = SyntheticCamera::new(SyntheticPattern::Gradient, &config);
        let a = camera.next_image();
        let b = camera.next_image();
        assert_eq!(a.dimensions(), (16, 4));
        assert_ne!(a.as_raw(), b.as_raw());
    }
}
