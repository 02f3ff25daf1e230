//! Duplex WebSocket link to the detection service.
//!
//! One I/O thread owns the socket. It alternates between writing the newest
//! pending frame and polling for inbound messages with a short read timeout.
//! Frames handed in while the socket is not open are dropped, and a frame that
//! has not been written yet is replaced by a newer one, so the service only
//! ever sees the freshest frame.

use std::net::{SocketAddr, TcpStream};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use tungstenite::{handshake::HandshakeError, Message, WebSocket};
use url::Url;

use crate::encoder::EncodedFrame;
use crate::protocol::{parse_update, PayloadError, Update, DEFAULT_MIN_CONFIDENCE};
use crate::slot::Latest;

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8000/ws";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub endpoint: String,
    /// Socket read and write timeout. Bounds how long the I/O thread can go
    /// without noticing `close`.
    pub poll_interval: Duration,
    pub min_confidence: f32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            poll_interval: Duration::from_millis(5),
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid endpoint `{0}`")]
    InvalidEndpoint(String, #[source] url::ParseError),
    #[error("unsupported endpoint scheme `{0}` (expected ws://)")]
    UnsupportedScheme(String),
    #[error("endpoint `{0}` has no host")]
    MissingHost(String),
}

pub fn validate_endpoint(endpoint: &str) -> Result<Url, ChannelError> {
    let url =
        Url::parse(endpoint).map_err(|err| ChannelError::InvalidEndpoint(endpoint.into(), err))?;
    if url.scheme() != "ws" {
        return Err(ChannelError::UnsupportedScheme(url.scheme().to_string()));
    }
    if url.host_str().is_none() {
        return Err(ChannelError::MissingHost(endpoint.to_string()));
    }
    Ok(url)
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Open,
    Closed,
}

impl ChannelStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the I/O thread.
    Queued,
    /// Handed to the I/O thread, replacing a frame that was never written.
    Superseded,
    /// Channel not open; the frame was discarded.
    Dropped,
}

/// Receives every successfully parsed inbound message, in arrival order.
pub trait UpdateHandler: Send + 'static {
    fn on_update(&mut self, update: Update);
}

impl<F> UpdateHandler for F
where
    F: FnMut(Update) + Send + 'static,
{
    fn on_update(&mut self, update: Update) {
        self(update)
    }
}

#[derive(Debug, Default)]
struct ChannelCounters {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    frames_superseded: AtomicU64,
    messages_received: AtomicU64,
    messages_rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub frames_superseded: u64,
    pub messages_received: u64,
    pub messages_rejected: u64,
}

#[derive(Debug)]
struct ChannelShared {
    status: AtomicU8,
    outbound: Latest<EncodedFrame>,
    stop: AtomicBool,
    counters: ChannelCounters,
}

impl ChannelShared {
    fn status(&self) -> ChannelStatus {
        ChannelStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: ChannelStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

pub struct TransmissionChannel {
    endpoint: String,
    shared: Arc<ChannelShared>,
    thread: Option<JoinHandle<()>>,
}

impl TransmissionChannel {
    /// Validates the endpoint and starts connecting in the background.
    ///
    /// A failed connection is logged and leaves the channel `Closed`; it is
    /// never retried.
    pub fn open(config: ChannelConfig, handler: impl UpdateHandler) -> anyhow::Result<Self> {
        let url = validate_endpoint(&config.endpoint)?;
        let endpoint = config.endpoint.clone();
        let shared = Arc::new(ChannelShared {
            status: AtomicU8::new(ChannelStatus::Connecting as u8),
            outbound: Latest::new(),
            stop: AtomicBool::new(false),
            counters: ChannelCounters::default(),
        });

        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("channel".into())
                .spawn(move || io_thread_main(url, config, shared, handler))
                .context("failed to start channel thread")?
        };

        Ok(Self {
            endpoint,
            shared,
            thread: Some(thread),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn status(&self) -> ChannelStatus {
        self.shared.status()
    }

    pub fn is_open(&self) -> bool {
        self.thread.is_some() && self.status() == ChannelStatus::Open
    }

    pub fn send_frame(&self, frame: EncodedFrame) -> SendOutcome {
        let counters = &self.shared.counters;
        if !self.is_open() {
            counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return SendOutcome::Dropped;
        }
        if self.shared.outbound.publish(frame) {
            counters.frames_superseded.fetch_add(1, Ordering::Relaxed);
            SendOutcome::Superseded
        } else {
            SendOutcome::Queued
        }
    }

    pub fn stats(&self) -> ChannelStats {
        let c = &self.shared.counters;
        ChannelStats {
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            frames_dropped: c.frames_dropped.load(Ordering::Relaxed),
            frames_superseded: c.frames_superseded.load(Ordering::Relaxed),
            messages_received: c.messages_received.load(Ordering::Acquire),
            messages_rejected: c.messages_rejected.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.thread.is_none()
    }

    /// Sends a close frame and joins the I/O thread. Safe to call twice.
    pub fn close(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::Relaxed);
        if thread.join().is_err() {
            tracing::warn!("channel thread for {} panicked", self.endpoint);
        }
        self.shared.outbound.clear();
        self.shared.set_status(ChannelStatus::Closed);
        tracing::info!("channel to {} closed", self.endpoint);
    }
}

impl Drop for TransmissionChannel {
    fn drop(&mut self) {
        self.close();
    }
}

enum Exit {
    Stopped,
    RemoteClosed,
}

fn io_thread_main(
    url: Url,
    config: ChannelConfig,
    shared: Arc<ChannelShared>,
    mut handler: impl UpdateHandler,
) {
    let mut socket = match connect(&url, config.poll_interval, &shared.stop) {
        Ok(Some(socket)) => socket,
        Ok(None) => {
            tracing::info!("connect to {url} abandoned");
            shared.set_status(ChannelStatus::Closed);
            return;
        }
        Err(err) => {
            tracing::error!("failed to connect to {url}: {err:#}");
            shared.set_status(ChannelStatus::Closed);
            return;
        }
    };

    shared.set_status(ChannelStatus::Open);
    tracing::info!("connected to {url}");

    let result = pump(&mut socket, &config, &shared, &mut handler);
    shared.set_status(ChannelStatus::Closed);

    match result {
        Ok(Exit::Stopped) => close_socket(&mut socket),
        Ok(Exit::RemoteClosed) => tracing::warn!("{url} closed the connection"),
        Err(err) => tracing::error!("channel to {url} failed: {err:#}"),
    }
}

/// Returns `Ok(None)` when `stop` was raised before the handshake finished.
fn connect(
    url: &Url,
    poll_interval: Duration,
    stop: &AtomicBool,
) -> anyhow::Result<Option<WebSocket<TcpStream>>> {
    let addrs = url
        .socket_addrs(|| None)
        .with_context(|| format!("failed to resolve {url}"))?;
    let stream = connect_any(&addrs).with_context(|| format!("TCP connect to {url}"))?;
    stream.set_nodelay(true).context("failed to set TCP_NODELAY")?;

    let timeout = Some(poll_interval.max(Duration::from_millis(1)));
    stream
        .set_read_timeout(timeout)
        .context("failed to set read timeout")?;
    stream
        .set_write_timeout(timeout)
        .context("failed to set write timeout")?;

    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let mut attempt = tungstenite::client(url.as_str(), stream);
    loop {
        match attempt {
            Ok((socket, _response)) => return Ok(Some(socket)),
            Err(HandshakeError::Interrupted(mid)) => {
                if stop.load(Ordering::Relaxed) {
                    return Ok(None);
                }
                if Instant::now() >= deadline {
                    anyhow::bail!("websocket handshake with {url} timed out");
                }
                attempt = mid.handshake();
            }
            Err(HandshakeError::Failure(err)) => {
                anyhow::bail!("websocket handshake with {url} failed: {err}")
            }
        }
    }
}

fn connect_any(addrs: &[SocketAddr]) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(addr, CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
    }))
}

fn pump(
    socket: &mut WebSocket<TcpStream>,
    config: &ChannelConfig,
    shared: &ChannelShared,
    handler: &mut impl UpdateHandler,
) -> anyhow::Result<Exit> {
    let counters = &shared.counters;
    // Set while a written frame is still partly buffered in the socket.
    let mut unflushed = false;
    loop {
        if shared.stop.load(Ordering::Relaxed) {
            return Ok(Exit::Stopped);
        }

        if unflushed {
            unflushed = match socket.flush() {
                Ok(()) => false,
                Err(tungstenite::Error::Io(err)) if is_timeout(&err) => true,
                Err(err) => return Err(err).context("failed to send frame"),
            };
        } else if let Some(frame) = shared.outbound.take() {
            counters.frames_sent.fetch_add(1, Ordering::Relaxed);
            match socket.send(Message::Text(frame.data_uri.clone())) {
                Ok(()) => {}
                Err(tungstenite::Error::Io(err)) if is_timeout(&err) => unflushed = true,
                Err(err) => return Err(err).context("failed to send frame"),
            }
        }

        match socket.read() {
            Ok(Message::Text(text)) => match parse_update(&text, config.min_confidence) {
                Ok(update) => {
                    handler.on_update(update);
                    counters.messages_received.fetch_add(1, Ordering::Release);
                }
                Err(err) => reject(counters, &err),
            },
            Ok(Message::Binary(bytes)) => reject(counters, &PayloadError::Binary(bytes.len())),
            Ok(Message::Ping(_)) => socket.flush().context("failed to answer ping")?,
            Ok(Message::Close(frame)) => {
                tracing::info!("close frame received: {frame:?}");
                let _ = socket.flush();
                return Ok(Exit::RemoteClosed);
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(err)) if is_timeout(&err) => {}
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                return Ok(Exit::RemoteClosed);
            }
            Err(err) => return Err(err).context("failed to read from socket"),
        }
    }
}

fn reject(counters: &ChannelCounters, err: &PayloadError) {
    counters.messages_rejected.fetch_add(1, Ordering::Relaxed);
    tracing::warn!("discarding inbound message: {err}");
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

fn close_socket(socket: &mut WebSocket<TcpStream>) {
    if let Err(err) = socket.close(None) {
        tracing::debug!("close handshake: {err}");
        return;
    }
    let deadline = Instant::now() + CLOSE_GRACE;
    while Instant::now() < deadline {
        match socket.read() {
            Ok(_) => {}
            Err(tungstenite::Error::Io(err)) if is_timeout(&err) => {}
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::mpsc;

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn frame(n: u64) -> EncodedFrame {
        EncodedFrame {
            data_uri: format!("data:image/jpeg;base64,{n}"),
            sequence: n,
        }
    }

    #[test]
    fn validates_endpoints() {
        assert!(validate_endpoint("ws://localhost:8000/ws").is_ok());
        assert!(matches!(
            validate_endpoint("http://localhost:8000/ws"),
            Err(ChannelError::UnsupportedScheme(s)) if s == "http"
        ));
        assert!(matches!(
            validate_endpoint("not a url"),
            Err(ChannelError::InvalidEndpoint(..))
        ));
    }

    #[test]
    fn invalid_endpoint_fails_open() {
        let config = ChannelConfig {
            endpoint: "wss://example.invalid/ws".into(),
            ..ChannelConfig::default()
        };
        let err = TransmissionChannel::open(config, |_update: Update| {})
            .err()
            .unwrap();
        assert!(err.downcast_ref::<ChannelError>().is_some());
    }

    #[test]
    fn close_interrupts_a_stalled_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted_tx, accepted_rx) = mpsc::channel();
        // Accepts TCP but never answers the upgrade request.
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            accepted_tx.send(()).unwrap();
            let mut buf = [0u8; 1024];
            while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
        });

        let config = ChannelConfig {
            endpoint: format!("ws://{addr}/ws"),
            ..ChannelConfig::default()
        };
        let mut channel = TransmissionChannel::open(config, |_update: Update| {}).unwrap();
        accepted_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(channel.status(), ChannelStatus::Connecting);
        assert_eq!(channel.send_frame(frame(1)), SendOutcome::Dropped);

        let (done_tx, done_rx) = mpsc::channel();
        std::thread::spawn(move || {
            channel.close();
            done_tx.send(channel.status()).unwrap();
        });
        let status = done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("close() did not return while connecting");
        assert_eq!(status, ChannelStatus::Closed);
        server.join().unwrap();
    }

    #[test]
    fn frames_are_dropped_when_connection_fails() {
        // Port 1 on loopback refuses connections.
        let config = ChannelConfig {
            endpoint: "ws://127.0.0.1:1/ws".into(),
            ..ChannelConfig::default()
        };
        let mut channel = TransmissionChannel::open(config, |_update: Update| {}).unwrap();
        assert!(wait_until(|| channel.status() == ChannelStatus::Closed));

        assert_eq!(channel.send_frame(frame(1)), SendOutcome::Dropped);
        assert_eq!(channel.stats().frames_dropped, 1);
        assert_eq!(channel.stats().frames_sent, 0);

        channel.close();
        assert!(channel.is_closed());
        channel.close();
    }
}
