use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::capture::CaptureConfig;
use crate::channel::{ChannelConfig, DEFAULT_ENDPOINT};
use crate::encoder::{EncoderConfig, FRAME_HEIGHT, FRAME_WIDTH};
use crate::protocol::DEFAULT_MIN_CONFIDENCE;

#[cfg(target_os = "macos")]
const DEFAULT_SPEECH_COMMAND: &str = "say";
#[cfg(not(target_os = "macos"))]
const DEFAULT_SPEECH_COMMAND: &str = "espeak";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SpeechEngine {
    /// Write alerts to the log only.
    Log,
    /// Speak alerts through an external TTS program (`--speech-command`).
    Command,
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "annotator",
    version,
    about = "Stream camera frames to a detection service and overlay the results"
)]
pub struct Cli {
    /// Detection service WebSocket endpoint.
    #[arg(long, env = "ANNOTATOR_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Camera device path, or `stub://black` / `stub://gradient` for a synthetic camera.
    #[arg(long, env = "ANNOTATOR_DEVICE", default_value = "/dev/video0")]
    pub device: String,

    /// Requested camera width (the device may pick another).
    #[arg(long, default_value_t = 640)]
    pub capture_width: u32,

    /// Requested camera height (the device may pick another).
    #[arg(long, default_value_t = 480)]
    pub capture_height: u32,

    /// Requested camera frame rate.
    #[arg(long, default_value_t = 30)]
    pub capture_fps: u32,

    /// Width of the frame sent to the detection service.
    #[arg(long, default_value_t = FRAME_WIDTH)]
    pub frame_width: u32,

    /// Height of the frame sent to the detection service.
    #[arg(long, default_value_t = FRAME_HEIGHT)]
    pub frame_height: u32,

    /// JPEG quality of transmitted frames, in (0, 1].
    #[arg(long, default_value_t = 0.5)]
    pub jpeg_quality: f32,

    /// Boxes below this confidence are discarded on arrival.
    #[arg(long, default_value_t = DEFAULT_MIN_CONFIDENCE)]
    pub min_confidence: f32,

    /// How alerts are announced.
    #[arg(long, value_enum, default_value_t = SpeechEngine::Log)]
    pub speech: SpeechEngine,

    /// TTS program used with `--speech command`; the alert text is appended.
    #[arg(long, default_value = DEFAULT_SPEECH_COMMAND)]
    pub speech_command: String,

    /// Run without the overlay window.
    #[arg(long)]
    pub no_ui: bool,

    /// Refresh interval (ms) of the headless loop.
    #[arg(long, default_value_t = 16)]
    pub tick_ms: u64,

    /// Initial overlay window width.
    #[arg(long, default_value_t = 960.0)]
    pub window_width: f32,

    /// Initial overlay window height.
    #[arg(long, default_value_t = 720.0)]
    pub window_height: f32,
}

impl Cli {
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            device: self.device.clone(),
            width: self.capture_width,
            height: self.capture_height,
            fps: self.capture_fps,
        }
    }

    pub fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig {
            width: self.frame_width.max(1),
            height: self.frame_height.max(1),
            quality: self.jpeg_quality.clamp(0.01, 1.0),
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            endpoint: self.endpoint.clone(),
            min_confidence: self.min_confidence,
            ..ChannelConfig::default()
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_detection_contract() {
        let cli = Cli::parse_from(["annotator"]);
        assert_eq!(cli.endpoint, "ws://localhost:8000/ws");
        let enc = cli.encoder_config();
        assert_eq!((enc.width, enc.height), (320, 240));
        assert_eq!(enc.quality, 0.5);
        assert_eq!(cli.channel_config().min_confidence, 0.85);
        assert_eq!(cli.speech, SpeechEngine::Log);
        assert!(!cli.no_ui);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "annotator",
            "--endpoint",
            "ws://10.0.0.2:9000/ws",
            "--device",
            "stub://black",
            "--jpeg-quality",
            "3",
            "--speech",
            "command",
            "--no-ui",
        ]);
        assert_eq!(cli.channel_config().endpoint, "ws://10.0.0.2:9000/ws");
        assert_eq!(cli.capture_config().device, "stub://black");
        assert_eq!(cli.encoder_config().quality, 1.0);
        assert_eq!(cli.speech, SpeechEngine::Command);
        assert!(cli.no_ui);
    }
}
