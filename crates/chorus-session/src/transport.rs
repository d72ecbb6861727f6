//! Transport abstraction and the reconnecting websocket implementation

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::handle::TransportHandle;

/// Receives every transport failure
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Default bound on frames queued while the socket is not open
pub const DEFAULT_MAX_PENDING: usize = 100;

/// Lifecycle of the underlying socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame received from the socket
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A text payload that parsed as JSON
    Json(Value),
    /// A text payload that did not parse, passed through as-is
    Raw(String),
    /// A binary payload
    Binary(Vec<u8>),
}

impl InboundFrame {
    /// Decode a text payload, falling back to the raw string
    pub fn decode_text(text: &str) -> Self {
        match serde_json::from_str(text) {
            Ok(value) => Self::Json(value),
            Err(_) => Self::Raw(text.to_string()),
        }
    }

    /// The frame as a value the normalizer accepts
    pub fn into_value(self) -> Value {
        match self {
            Self::Json(value) => value,
            Self::Raw(text) => Value::String(text),
            Self::Binary(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        }
    }
}

/// A duplex frame channel to the backend
#[async_trait]
pub trait Transport: Send {
    /// Serialize and transmit a frame. Never fails; frames sent while the
    /// socket is not open are queued.
    fn send(&self, frame: &Value);

    /// Wait for the next inbound frame. `None` once delivery has stopped.
    async fn recv(&mut self) -> Option<InboundFrame>;

    fn connection_state(&self) -> ConnectionState;

    fn connected(&self) -> bool {
        self.connection_state() == ConnectionState::Open
    }

    /// Replace the socket and resume delivery
    fn reconnect(&mut self);

    /// Stop delivery and reconnection
    fn disconnect(&mut self);
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of consecutive failed attempts (`None` retries forever)
    pub max_retries: Option<u32>,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }

    /// Check whether another attempt is allowed after `attempt` failures
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_retries.is_none_or(|max| attempt < max)
    }
}

/// Socket transport configuration
#[derive(Clone)]
pub struct TransportConfig {
    pub url: String,
    pub retry: RetryConfig,
    /// Interval between websocket pings (`None` disables the heartbeat)
    pub heartbeat_interval: Option<Duration>,
    /// Silence after which the socket is presumed dead
    pub heartbeat_timeout: Duration,
    /// Bound on the outbound queue
    pub max_pending: usize,
    /// Reconnect after the socket drops
    pub auto_reconnect: bool,
    pub on_error: Option<ErrorCallback>,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            retry: RetryConfig::default(),
            heartbeat_interval: Some(Duration::from_secs(30)),
            heartbeat_timeout: Duration::from_secs(75),
            max_pending: DEFAULT_MAX_PENDING,
            auto_reconnect: true,
            on_error: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_heartbeat(mut self, interval: Option<Duration>, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_on_error(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("url", &self.url)
            .field("retry", &self.retry)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("max_pending", &self.max_pending)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Websocket transport that reconnects with backoff.
///
/// A background task owns the socket; it is replaced wholesale on
/// [`reconnect`](Transport::reconnect). Must be created inside a Tokio runtime.
pub struct SocketTransport {
    config: Arc<TransportConfig>,
    handle: TransportHandle,
    inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

impl SocketTransport {
    /// Start connecting in the background
    pub fn connect(config: TransportConfig) -> Self {
        let handle = TransportHandle::new(config.max_pending, config.on_error.clone());
        let config = Arc::new(config);
        let inbound = spawn_connection(&config, &handle);
        Self {
            config,
            handle,
            inbound,
        }
    }

    /// Get a handle on the shared transport state
    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn send(&self, frame: &Value) {
        match serde_json::to_string(frame) {
            Ok(text) => self.handle.enqueue(text),
            Err(e) => self.handle.report(&Error::Json(e)),
        }
    }

    async fn recv(&mut self) -> Option<InboundFrame> {
        self.inbound.recv().await
    }

    fn connection_state(&self) -> ConnectionState {
        self.handle.state()
    }

    fn reconnect(&mut self) {
        tracing::info!("Reconnecting to {}", self.config.url);
        self.inbound = spawn_connection(&self.config, &self.handle);
    }

    fn disconnect(&mut self) {
        tracing::info!("Disconnecting from {}", self.config.url);
        self.handle.cancel();
        let (_, closed) = mpsc::unbounded_channel();
        self.inbound = closed;
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

fn spawn_connection(
    config: &Arc<TransportConfig>,
    handle: &TransportHandle,
) -> mpsc::UnboundedReceiver<InboundFrame> {
    let (tx, rx) = mpsc::unbounded_channel();
    let (generation, cancel) = handle.begin_generation();
    tokio::spawn(run_connection(
        Arc::clone(config),
        handle.clone(),
        generation,
        cancel,
        tx,
    ));
    rx
}

/// Connect, pump frames, and reconnect until cancelled or out of retries
async fn run_connection(
    config: Arc<TransportConfig>,
    handle: TransportHandle,
    generation: u64,
    cancel: CancellationToken,
    inbound: mpsc::UnboundedSender<InboundFrame>,
) {
    let mut attempt: u32 = 0;
    loop {
        handle.set_state(generation, ConnectionState::Connecting);
        let connect = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connect_async(config.url.as_str()) => result,
        };

        let failure = match connect {
            Ok((socket, _)) => {
                attempt = 0;
                tracing::info!("Connected to {}", config.url);
                handle.set_state(generation, ConnectionState::Open);
                let session = Session {
                    config: &config,
                    handle: &handle,
                    generation,
                    cancel: &cancel,
                    inbound: &inbound,
                };
                match session.pump(socket).await {
                    Ok(()) => break,
                    Err(e) => e,
                }
            }
            Err(e) => Error::from(e),
        };

        handle.report(&failure);
        if !config.auto_reconnect || !failure.is_retryable() {
            break;
        }
        if !config.retry.allows(attempt) {
            handle.report(&Error::ReconnectExhausted(attempt));
            break;
        }

        let delay = config.retry.delay_for_attempt(attempt);
        attempt += 1;
        tracing::info!("Reconnecting in {:?} (attempt {})", delay, attempt);
        handle.set_state(generation, ConnectionState::Connecting);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    if handle.set_state(generation, ConnectionState::Closed) {
        tracing::info!("Connection to {} closed", config.url);
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything one open socket needs from its connection task
struct Session<'a> {
    config: &'a TransportConfig,
    handle: &'a TransportHandle,
    generation: u64,
    cancel: &'a CancellationToken,
    inbound: &'a mpsc::UnboundedSender<InboundFrame>,
}

impl Session<'_> {
    /// Move frames until the socket fails. `Ok` means delivery should stop.
    async fn pump(&self, socket: Socket) -> Result<()> {
        let (mut sink, mut stream) = socket.split();
        let mut last_seen = Instant::now();
        let mut heartbeat = self
            .config
            .heartbeat_interval
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        loop {
            while let Some(text) = self.handle.pop_pending() {
                if let Err(e) = sink.send(Message::text(text.clone())).await {
                    self.handle.requeue_front(text);
                    return Err(e.into());
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.handle.set_state(self.generation, ConnectionState::Closing);
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = self.inbound.closed() => {
                    tracing::debug!("Inbound receiver dropped, closing socket");
                    self.handle.set_state(self.generation, ConnectionState::Closing);
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = self.handle.flush_notify.notified() => {}
                _ = tick(&mut heartbeat) => {
                    if last_seen.elapsed() >= self.config.heartbeat_timeout {
                        return Err(Error::HeartbeatTimeout(self.config.heartbeat_timeout));
                    }
                    sink.send(Message::Ping(Default::default())).await?;
                }
                message = stream.next() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(Error::Closed("stream ended".to_string())),
                    };
                    last_seen = Instant::now();
                    let frame = match message {
                        Message::Text(text) => InboundFrame::decode_text(text.as_str()),
                        Message::Binary(bytes) => InboundFrame::Binary(bytes.to_vec()),
                        Message::Close(frame) => {
                            let reason = frame
                                .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                                .unwrap_or_else(|| "no close frame".to_string());
                            return Err(Error::Closed(reason));
                        }
                        _ => continue,
                    };
                    if self.inbound.send(frame).is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    const WAIT: Duration = Duration::from_secs(5);

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (tcp, _) = listener.accept().await.unwrap();
        accept_async(tcp).await.unwrap()
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
        }
    }

    async fn wait_for_state(transport: &SocketTransport, state: ConnectionState) {
        for _ in 0..200 {
            if transport.connection_state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transport never reached {}", state);
    }

    #[test]
    fn test_delay_for_attempt() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(retry.delay_for_attempt(20), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_allowance() {
        assert!(RetryConfig::default().allows(1_000));
        let capped = RetryConfig {
            max_retries: Some(2),
            ..Default::default()
        };
        assert!(capped.allows(1));
        assert!(!capped.allows(2));
    }

    #[test]
    fn test_decode_text_passes_malformed_through() {
        assert_eq!(
            InboundFrame::decode_text(r#"{"type":"text"}"#),
            InboundFrame::Json(json!({"type": "text"}))
        );
        assert_eq!(
            InboundFrame::decode_text("{broken"),
            InboundFrame::Raw("{broken".to_string())
        );
        assert_eq!(
            InboundFrame::Raw("<workflow_done>".into()).into_value(),
            json!("<workflow_done>")
        );
    }

    #[tokio::test]
    async fn test_inbound_frames_decoded() {
        let (listener, url) = listen().await;
        tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            ws.send(Message::text(r#"{"type":"text","n":1}"#)).await.unwrap();
            ws.send(Message::text("{broken")).await.unwrap();
            ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let mut transport = SocketTransport::connect(TransportConfig::new(url));
        let first = timeout(WAIT, transport.recv()).await.unwrap();
        assert_eq!(first, Some(InboundFrame::Json(json!({"type": "text", "n": 1}))));
        let second = timeout(WAIT, transport.recv()).await.unwrap();
        assert_eq!(second, Some(InboundFrame::Raw("{broken".to_string())));
        let third = timeout(WAIT, transport.recv()).await.unwrap();
        assert_eq!(third, Some(InboundFrame::Binary(vec![1, 2, 3])));
        assert!(transport.connected());
    }

    #[tokio::test]
    async fn test_send_before_open_is_flushed() {
        let (listener, url) = listen().await;
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    let _ = seen_tx.send(text.as_str().to_string());
                    break;
                }
            }
        });

        let transport = SocketTransport::connect(TransportConfig::new(url));
        transport.send(&json!({"type": "start", "workflow": "demo"}));
        let received = timeout(WAIT, seen_rx).await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&received).unwrap();
        assert_eq!(value, json!({"type": "start", "workflow": "demo"}));
        assert_eq!(transport.handle().pending_len(), 0);
    }

    #[tokio::test]
    async fn test_reconnects_after_server_close() {
        let (listener, url) = listen().await;
        tokio::spawn(async move {
            let mut first = accept(&listener).await;
            first.close(None).await.unwrap();
            drop(first);
            let mut second = accept(&listener).await;
            second.send(Message::text(r#"{"type":"text","n":2}"#)).await.unwrap();
            while second.next().await.is_some() {}
        });

        let config = TransportConfig::new(url).with_retry(fast_retry());
        let mut transport = SocketTransport::connect(config);
        let frame = timeout(WAIT, transport.recv()).await.unwrap();
        assert_eq!(frame, Some(InboundFrame::Json(json!({"type": "text", "n": 2}))));
    }

    #[tokio::test]
    async fn test_disconnect_then_reconnect() {
        let (listener, url) = listen().await;
        tokio::spawn(async move {
            let mut n = 0;
            loop {
                let mut ws = accept(&listener).await;
                n += 1;
                tokio::spawn(async move {
                    let hello = json!({"type": "hello", "n": n}).to_string();
                    let _ = ws.send(Message::text(hello)).await;
                    while ws.next().await.is_some() {}
                });
            }
        });

        let mut transport = SocketTransport::connect(TransportConfig::new(url));
        let first = timeout(WAIT, transport.recv()).await.unwrap();
        assert_eq!(first, Some(InboundFrame::Json(json!({"type": "hello", "n": 1}))));

        transport.disconnect();
        assert_eq!(transport.connection_state(), ConnectionState::Closed);
        assert_eq!(timeout(WAIT, transport.recv()).await.unwrap(), None);

        // Frames sent while disconnected wait for the next socket
        transport.send(&json!({"type": "queued"}));
        assert_eq!(transport.handle().pending_len(), 1);

        transport.reconnect();
        let second = timeout(WAIT, transport.recv()).await.unwrap();
        assert_eq!(second, Some(InboundFrame::Json(json!({"type": "hello", "n": 2}))));
        wait_for_state(&transport, ConnectionState::Open).await;
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_errors() {
        let (listener, url) = listen().await;
        drop(listener);

        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        let config = TransportConfig::new(url)
            .with_retry(RetryConfig {
                max_retries: Some(0),
                ..fast_retry()
            })
            .with_on_error(move |e| {
                let _ = err_tx.send(e.to_string());
            });
        let mut transport = SocketTransport::connect(config);

        // Delivery stops once the retry budget runs out
        assert_eq!(timeout(WAIT, transport.recv()).await.unwrap(), None);
        assert!(err_rx.recv().await.unwrap().contains("WebSocket"));
        assert!(err_rx.recv().await.unwrap().contains("Gave up"));
        wait_for_state(&transport, ConnectionState::Closed).await;
    }

    #[tokio::test]
    async fn test_unreachable_server_without_callback() {
        let (listener, url) = listen().await;
        drop(listener);

        let config = TransportConfig::new(url).with_retry(RetryConfig {
            max_retries: Some(1),
            ..fast_retry()
        });
        let mut transport = SocketTransport::connect(config);
        transport.send(&json!({"type": "never_sent"}));
        assert_eq!(timeout(WAIT, transport.recv()).await.unwrap(), None);
        assert!(!transport.connected());
        assert_eq!(transport.handle().pending_len(), 1);
    }

    #[tokio::test]
    async fn test_silent_server_trips_heartbeat() {
        let (listener, url) = listen().await;
        tokio::spawn(async move {
            let _ws = accept(&listener).await;
            // Never read, so pings go unanswered
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        let mut config = TransportConfig::new(url)
            .with_heartbeat(Some(Duration::from_millis(20)), Duration::from_millis(60))
            .with_on_error(move |e| {
                let _ = err_tx.send(matches!(e, Error::HeartbeatTimeout(_)));
            });
        config.auto_reconnect = false;
        let _transport = SocketTransport::connect(config);

        assert!(timeout(WAIT, err_rx.recv()).await.unwrap().unwrap());
    }
}
