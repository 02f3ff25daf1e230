use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::announcer::{
    AlertAnnouncer, CommandSpeech, LogSpeech, SpeechDispatcher, SpeechHandle, SpeechSink,
};
use crate::capture::{CaptureConfig, CaptureSource, Frame};
use crate::channel::{
    ChannelConfig, ChannelStats, ChannelStatus, SendOutcome, TransmissionChannel, UpdateHandler,
};
use crate::config::{Cli, SpeechEngine};
use crate::detection::{DetectionSet, DetectionState};
use crate::encoder::{EncoderConfig, FrameEncoder};
use crate::protocol::Update;
use crate::render::{OverlayRenderer, RenderOutcome, RenderSurface, TraceSurface};
use crate::ui::run_overlay;

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub capture: CaptureConfig,
    pub encoder: EncoderConfig,
    pub channel: ChannelConfig,
}

impl From<&Cli> for SessionConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            capture: cli.capture_config(),
            encoder: cli.encoder_config(),
            channel: cli.channel_config(),
        }
    }
}

/// Inbound half of the session: runs on the channel thread for every parsed
/// message.
struct ReceivePath {
    detections: DetectionState,
    announcer: AlertAnnouncer,
    speech: SpeechHandle,
}

impl UpdateHandler for ReceivePath {
    fn on_update(&mut self, update: Update) {
        let Update { detections, alert } = update;
        tracing::debug!("received {} boxes", detections.len());
        self.detections.replace(detections);

        if let Some(text) = self.announcer.offer(alert.as_deref()) {
            self.speech.dispatch(text);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// `None` when no new camera frame was available this tick.
    pub sent: Option<SendOutcome>,
    pub render: RenderOutcome,
}

/// One camera, one channel, one overlay.
///
/// Both resources are acquired in `start` and released together in `stop`
/// (or on drop). If the channel cannot be set up, the already opened camera is
/// released before the error is returned.
pub struct Session {
    capture: CaptureSource,
    channel: TransmissionChannel,
    speech: SpeechDispatcher,
    encoder: FrameEncoder,
    renderer: OverlayRenderer,
    detections: DetectionState,
    announcer: AlertAnnouncer,
    camera_failure_logged: bool,
    last_sequence: u64,
    frames_encoded: u64,
    stopped: bool,
    stats_logged_at: Instant,
}

impl Session {
    pub fn start(config: SessionConfig, sink: Box<dyn SpeechSink>) -> anyhow::Result<Self> {
        let capture = CaptureSource::open(config.capture.clone())
            .with_context(|| format!("failed to open camera {}", config.capture.device))?;

        let speech = SpeechDispatcher::start(sink).context("failed to start speech worker")?;
        let detections = DetectionState::new();
        let announcer = AlertAnnouncer::new();
        let receive = ReceivePath {
            detections: detections.clone(),
            announcer: announcer.clone(),
            speech: speech
                .handle()
                .context("speech worker stopped during startup")?,
        };

        let channel = TransmissionChannel::open(config.channel.clone(), receive)
            .with_context(|| format!("failed to open channel to {}", config.channel.endpoint))?;

        Ok(Self {
            capture,
            channel,
            speech,
            encoder: FrameEncoder::new(config.encoder),
            renderer: OverlayRenderer::new(config.encoder.width, config.encoder.height),
            detections,
            announcer,
            camera_failure_logged: false,
            last_sequence: 0,
            frames_encoded: 0,
            stopped: false,
            stats_logged_at: Instant::now(),
        })
    }

    /// One refresh tick: encode and send the newest camera frame (if it is new),
    /// then draw the freshest detection set.
    pub fn tick(&mut self, surface: &mut dyn RenderSurface) -> TickReport {
        if self.stopped {
            return TickReport {
                sent: None,
                render: RenderOutcome::Skipped,
            };
        }

        if !self.camera_failure_logged && !self.capture.is_healthy() {
            self.camera_failure_logged = true;
            tracing::error!("camera {} stopped producing frames", self.capture.device());
        }

        let sent = self.transmit_latest();
        let render = self.renderer.render(surface, &self.detections.snapshot());
        self.maybe_log_stats();

        TickReport { sent, render }
    }

    fn transmit_latest(&mut self) -> Option<SendOutcome> {
        let frame = self.capture.latest_frame()?;
        if frame.sequence == self.last_sequence {
            return None;
        }
        self.last_sequence = frame.sequence;

        match self.encoder.encode(&frame) {
            Ok(encoded) => {
                self.frames_encoded += 1;
                Some(self.channel.send_frame(encoded))
            }
            Err(err) => {
                tracing::warn!("skipping frame {}: {err:#}", frame.sequence);
                None
            }
        }
    }

    fn maybe_log_stats(&mut self) {
        if self.stats_logged_at.elapsed() < STATS_INTERVAL {
            return;
        }
        self.stats_logged_at = Instant::now();
        let stats = self.channel.stats();
        tracing::info!(
            "camera={} encoded={} sent={} dropped={} superseded={} received={} rejected={} status={:?}",
            if self.capture.is_healthy() { "ok" } else { "failed" },
            self.frames_encoded,
            stats.frames_sent,
            stats.frames_dropped,
            stats.frames_superseded,
            stats.messages_received,
            stats.messages_rejected,
            self.channel.status()
        );
    }

    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.capture.latest_frame()
    }

    pub fn detections(&self) -> DetectionSet {
        self.detections.snapshot()
    }

    pub fn detection_state(&self) -> &DetectionState {
        &self.detections
    }

    pub fn last_alert(&self) -> Option<String> {
        self.announcer.last_announced()
    }

    /// `false` once the camera stream has failed after being acquired.
    pub fn camera_healthy(&self) -> bool {
        self.capture.is_healthy()
    }

    pub fn channel_status(&self) -> ChannelStatus {
        self.channel.status()
    }

    pub fn channel_stats(&self) -> ChannelStats {
        self.channel.stats()
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn camera_released(&self) -> bool {
        self.capture.is_released()
    }

    pub fn channel_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// Releases the camera and closes the channel. Safe to call twice.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.capture.release();
        self.channel.close();
        self.speech.shutdown();
        tracing::info!("session stopped after {} frames", self.frames_encoded);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

fn speech_sink(cli: &Cli) -> anyhow::Result<Box<dyn SpeechSink>> {
    Ok(match cli.speech {
        SpeechEngine::Log => Box::new(LogSpeech),
        SpeechEngine::Command => Box::new(
            CommandSpeech::new(&cli.speech_command).context("invalid --speech-command")?,
        ),
    })
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    let sink = speech_sink(&cli)?;
    let session = Session::start(SessionConfig::from(&cli), sink)?;

    if cli.no_ui {
        run_headless(session, &cli)
    } else {
        run_overlay(session, cli.window_width, cli.window_height)
    }
}

fn run_headless(mut session: Session, cli: &Cli) -> anyhow::Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
        })
        .context("failed to set Ctrl-C handler")?;
    }

    let mut surface = TraceSurface {
        width: cli.frame_width as f32,
        height: cli.frame_height as f32,
    };
    let interval = cli.tick_interval();

    while !stop.load(Ordering::Relaxed) {
        let started = Instant::now();
        session.tick(&mut surface);
        if let Some(rest) = interval.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    session.stop();
    Ok(())
}
