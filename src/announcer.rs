use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

/// Fire-and-forget speech output.
pub trait SpeechSink: Send {
    fn speak(&self, text: &str);
}

/// Writes announcements to the log instead of a speaker.
#[derive(Debug, Default, Clone)]
pub struct LogSpeech;

impl SpeechSink for LogSpeech {
    fn speak(&self, text: &str) {
        tracing::info!("alert: {text}");
    }
}

/// Runs an external text-to-speech program (`espeak`, `say`, ...) with the text
/// as its last argument.
#[derive(Debug, Clone)]
pub struct CommandSpeech {
    program: String,
    args: Vec<String>,
}

impl CommandSpeech {
    pub fn new(command_line: &str) -> anyhow::Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty speech command"))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl SpeechSink for CommandSpeech {
    fn speak(&self, text: &str) {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match child {
            Ok(mut child) => {
                let program = self.program.clone();
                std::thread::spawn(move || match child.wait() {
                    Ok(status) if !status.success() => {
                        tracing::warn!("{program} exited with {status}");
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!("failed waiting for {program}: {err}"),
                });
            }
            Err(err) => tracing::warn!("failed to run {}: {err}", self.program),
        }
    }
}

/// Exact-match dedup of consecutive alerts.
///
/// An alert is announced when it differs from the last announced one. A
/// repeated alert is spoken again once a different alert came in between.
/// Clones share the same last-announced value.
#[derive(Debug, Default, Clone)]
pub struct AlertAnnouncer {
    last_announced: Arc<Mutex<Option<String>>>,
}

impl AlertAnnouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the text to speak, if any.
    pub fn offer(&self, alert: Option<&str>) -> Option<String> {
        let alert = alert?;
        let mut last = self.last_announced.lock();
        if last.as_deref() == Some(alert) {
            return None;
        }
        *last = Some(alert.to_string());
        Some(alert.to_string())
    }

    pub fn last_announced(&self) -> Option<String> {
        self.last_announced.lock().clone()
    }
}

/// Cloneable sending side of a [`SpeechDispatcher`].
#[derive(Debug, Clone)]
pub struct SpeechHandle {
    tx: Sender<String>,
}

impl SpeechHandle {
    pub fn dispatch(&self, text: String) {
        if self.tx.send(text).is_err() {
            tracing::warn!("speech worker is gone; dropping alert");
        }
    }
}

/// Owns the speech sink on a worker thread so speaking never blocks the caller.
pub struct SpeechDispatcher {
    handle: Option<SpeechHandle>,
    worker: Option<JoinHandle<()>>,
}

impl SpeechDispatcher {
    pub fn start(sink: Box<dyn SpeechSink>) -> anyhow::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<String>();
        let worker = std::thread::Builder::new()
            .name("speech".into())
            .spawn(move || {
                for text in rx {
                    sink.speak(&text);
                }
            })?;
        Ok(Self {
            handle: Some(SpeechHandle { tx }),
            worker: Some(worker),
        })
    }

    /// A sender for the worker, or `None` after shutdown.
    pub fn handle(&self) -> Option<SpeechHandle> {
        self.handle.clone()
    }

    /// Drains queued announcements and stops the worker once every
    /// [`SpeechHandle`] has been dropped.
    pub fn shutdown(&mut self) {
        drop(self.handle.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("speech worker panicked");
            }
        }
    }
}

impl Drop for SpeechDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug, Default, Clone)]
    pub(crate) struct RecordingSpeech {
        pub spoken: Arc<Mutex<Vec<String>>>,
    }

    impl SpeechSink for RecordingSpeech {
        fn speak(&self, text: &str) {
            self.spoken.lock().push(text.to_string());
        }
    }

    #[test]
    fn repeats_are_suppressed_until_interrupted() {
        let announcer = AlertAnnouncer::new();
        let spoken: Vec<_> = ["A", "A", "B", "A"]
            .into_iter()
            .filter_map(|a| announcer.offer(Some(a)))
            .collect();
        assert_eq!(spoken, ["A", "B", "A"]);
        assert_eq!(announcer.last_announced().as_deref(), Some("A"));
    }

    #[test]
    fn missing_alert_keeps_last_announced() {
        let announcer = AlertAnnouncer::new();
        assert_eq!(announcer.offer(Some("Hazard: car detected!")).as_deref(), Some("Hazard: car detected!"));
        assert_eq!(announcer.offer(None), None);
        assert_eq!(announcer.offer(Some("Hazard: car detected!")), None);
    }

    #[test]
    fn comparison_is_exact() {
        let announcer = AlertAnnouncer::new();
        assert!(announcer.offer(Some("car")).is_some());
        assert!(announcer.offer(Some("Car")).is_some());
        assert!(announcer.offer(Some("Car ")).is_some());
    }

    #[test]
    fn clones_share_last_announced() {
        let announcer = AlertAnnouncer::new();
        let reader = announcer.clone();
        announcer.offer(Some("Hazard: bus detected!"));
        assert_eq!(reader.last_announced().as_deref(), Some("Hazard: bus detected!"));
        assert_eq!(reader.offer(Some("Hazard: bus detected!")), None);
    }

    #[test]
    fn dispatcher_delivers_in_order() -> anyhow::Result<()> {
        let sink = RecordingSpeech::default();
        let mut dispatcher = SpeechDispatcher::start(Box::new(sink.clone()))?;
        let handle = dispatcher.handle().unwrap();
        handle.dispatch("one".into());
        handle.dispatch("two".into());
        drop(handle);
        dispatcher.shutdown();
        assert!(dispatcher.handle().is_none());
        assert_eq!(*sink.spoken.lock(), ["one", "two"]);
        Ok(())
    }

    #[test]
    fn command_line_is_split() -> anyhow::Result<()> {
        let speech = CommandSpeech::new("espeak -s 150")?;
        assert_eq!(speech.program, "espeak");
        assert_eq!(speech.args, ["-s", "150"]);
        assert!(CommandSpeech::new("   ").is_err());
        Ok(())
    }
}
