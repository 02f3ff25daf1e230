//! Live camera source.
//!
//! `CaptureSource::open` acquires the device synchronously so that a missing
//! camera or a denied permission fails the caller right away. After that a
//! capture thread owns the device and keeps publishing the newest frame into a
//! single-slot cell; older frames are overwritten, never queued.

mod synthetic;
#[cfg(feature = "v4l2")]
mod v4l2;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;

use image::RgbImage;

use crate::slot::Latest;

pub use synthetic::SyntheticPattern;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Device path (`/dev/video0`) or `stub://<pattern>[?frames=N]` for a synthetic source.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no camera device at {0}")]
    NoDevice(String),
    #[error("access to camera {0} was denied")]
    PermissionDenied(String),
    #[error("unsupported camera source: {0}")]
    Unsupported(String),
    #[error("camera format negotiation failed: {0}")]
    Format(String),
    #[error("camera I/O error on {device}")]
    Io {
        device: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start capture thread")]
    Spawn(#[source] std::io::Error),
}

impl CaptureError {
    #[cfg_attr(not(feature = "v4l2"), allow(dead_code))]
    pub(crate) fn from_io(device: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NoDevice(device.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(device.to_string()),
            _ => Self::Io {
                device: device.to_string(),
                source: err,
            },
        }
    }
}

/// One RGB frame as delivered by the camera.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub sequence: u64,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// State shared between the capture thread and its owner.
#[derive(Debug, Default)]
pub(crate) struct CaptureShared {
    pub(crate) frames: Latest<Frame>,
    pub(crate) captured: AtomicU64,
    pub(crate) stop: AtomicBool,
    pub(crate) failed: AtomicBool,
}

impl CaptureShared {
    pub(crate) fn push(&self, image: RgbImage) {
        let sequence = self.captured.fetch_add(1, Ordering::Relaxed) + 1;
        self.frames.publish(Frame { image, sequence });
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

enum Backend {
    Synthetic(synthetic::SyntheticCamera),
    #[cfg(feature = "v4l2")]
    Device(v4l2::V4l2Camera),
}

impl Backend {
    fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        if let Some(pattern) = config.device.strip_prefix("stub://") {
            let (pattern, limit) = synthetic::parse_stub(pattern)?;
            return Ok(Self::Synthetic(
                synthetic::SyntheticCamera::new(pattern, config).with_frame_limit(limit),
            ));
        }

        #[cfg(feature = "v4l2")]
        {
            Ok(Self::Device(v4l2::V4l2Camera::open(config)?))
        }

        #[cfg(not(feature = "v4l2"))]
        {
            Err(CaptureError::Unsupported(format!(
                "{} (built without the `v4l2` feature)",
                config.device
            )))
        }
    }

    fn run(self, shared: Arc<CaptureShared>) -> anyhow::Result<()> {
        match self {
            Self::Synthetic(camera) => camera.run(&shared),
            #[cfg(feature = "v4l2")]
            Self::Device(camera) => camera.run(&shared),
        }
    }
}

/// Exclusive handle on one live video stream.
pub struct CaptureSource {
    device: String,
    shared: Arc<CaptureShared>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureSource {
    pub fn open(config: CaptureConfig) -> Result<Self, CaptureError> {
        let backend = Backend::open(&config)?;
        let shared = Arc::new(CaptureShared::default());

        let thread = {
            let shared = shared.clone();
            let device = config.device.clone();
            std::thread::Builder::new()
                .name("capture".into())
                .spawn(move || {
                    if let Err(err) = backend.run(shared.clone()) {
                        tracing::error!("capture from {device} stopped: {err:#}");
                        shared.failed.store(true, Ordering::Relaxed);
                    }
                })
                .map_err(CaptureError::Spawn)?
        };

        tracing::info!("camera {} acquired", config.device);
        Ok(Self {
            device: config.device,
            shared,
            thread: Some(thread),
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Most recent frame, if the camera has produced one yet.
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.shared.frames.snapshot()
    }

    pub fn frames_captured(&self) -> u64 {
        self.shared.captured.load(Ordering::Relaxed)
    }

    pub fn is_released(&self) -> bool {
        self.thread.is_none()
    }

    /// `false` once the capture thread has stopped on an error.
    pub fn is_healthy(&self) -> bool {
        !self.shared.failed.load(Ordering::Relaxed)
    }

    /// Stops the capture thread and gives the device back. Safe to call twice.
    pub fn release(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::Relaxed);
        if thread.join().is_err() {
            tracing::warn!("capture thread for {} panicked", self.device);
        }
        self.shared.frames.clear();
        tracing::info!("camera {} released", self.device);
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn stub(pattern: &str) -> CaptureConfig {
        CaptureConfig {
            device: format!("stub://{pattern}"),
            width: 64,
            height: 48,
            fps: 200,
        }
    }

    fn wait_for_frame(source: &CaptureSource) -> Arc<Frame> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(frame) = source.latest_frame() {
                return frame;
            }
            assert!(Instant::now() < deadline, "no frame within 5s");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn synthetic_source_produces_frames() {
        let source = CaptureSource::open(stub("gradient")).unwrap();
        let frame = wait_for_frame(&source);
        assert_eq!((frame.width(), frame.height()), (64, 48));
        assert!(frame.sequence >= 1);
    }

    #[test]
    fn black_pattern_is_all_zero() {
        let source = CaptureSource::open(stub("black")).unwrap();
        let frame = wait_for_frame(&source);
        assert!(frame.image.as_raw().iter().all(|&p| p == 0));
    }

    #[test]
    fn unknown_pattern_fails_loudly() {
        let err = CaptureSource::open(stub("plaid")).err().unwrap();
        assert!(matches!(err, CaptureError::Unsupported(_)));
    }

    #[cfg(not(feature = "v4l2"))]
    #[test]
    fn real_device_requires_feature() {
        let err = CaptureSource::open(CaptureConfig::default()).err().unwrap();
        assert!(matches!(err, CaptureError::Unsupported(_)));
    }

    #[test]
    fn io_errors_map_to_explicit_variants() {
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(matches!(
            CaptureError::from_io("/dev/video9", missing),
            CaptureError::NoDevice(d) if d == "/dev/video9"
        ));
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(
            CaptureError::from_io("/dev/video0", denied),
            CaptureError::PermissionDenied(_)
        ));
    }

    #[test]
    fn stream_failure_marks_source_unhealthy() {
        let source = CaptureSource::open(stub("black?frames=2")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while source.is_healthy() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!source.is_healthy());
        assert_eq!(source.frames_captured(), 2);
    }

    #[test]
    fn release_stops_capture_and_drops_frames() {
        let mut source = CaptureSource::open(stub("gradient")).unwrap();
        wait_for_frame(&source);
        source.release();
        assert!(source.is_released());
        assert!(source.latest_frame().is_none());

        let count = source.frames_captured();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(source.frames_captured(), count);
        source.release();
    }
}
