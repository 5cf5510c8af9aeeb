//! Session transports.
//!
//! A transport moves [`Frame`]s: text frames carry JSON messages, ping and
//! pong frames carry liveness (payload: the plcId bytes). Both ends see a
//! [`FrameChannel`]: a sender plus a receiver. A closed receiver (`None`) or
//! a `Close` frame ends the session.
//!
//! Implementations:
//!
//! - [`duplex`]: in-memory pair, for tests and in-process wiring
//! - [`server_channel`] / [`WsConnector`]: WebSocket, frames map one to one
//!   onto WebSocket text, ping, pong and close messages

use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::MaybeTlsStream;

use crate::core::error::{GatewayError, Result};

/// Largest WebSocket message accepted unless configured otherwise.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1 << 20;

/// One transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Sending half of a transport.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Frame>,
}

impl FrameSender {
    /// Queue a frame. Fails once the transport is closed.
    pub fn send(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| GatewayError::Io("transport closed".into()))
    }

    /// Whether the other side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One end of a transport.
#[derive(Debug)]
pub struct FrameChannel {
    pub tx: FrameSender,
    pub rx: mpsc::UnboundedReceiver<Frame>,
    /// Local IP address, when the transport has one.
    pub local_addr: Option<String>,
    /// Human-readable peer description.
    pub peer: String,
}

impl FrameChannel {
    /// Split into sender and receiver.
    pub fn split(self) -> (FrameSender, mpsc::UnboundedReceiver<Frame>) {
        (self.tx, self.rx)
    }
}

/// In-memory transport pair.
pub fn duplex() -> (FrameChannel, FrameChannel) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        FrameChannel {
            tx: FrameSender { tx: a_tx },
            rx: a_rx,
            local_addr: None,
            peer: "memory".to_string(),
        },
        FrameChannel {
            tx: FrameSender { tx: b_tx },
            rx: b_rx,
            local_addr: None,
            peer: "memory".to_string(),
        },
    )
}

/// WebSocket message types that carry frames.
trait WireMessage: Sized + Send + Unpin + 'static {
    /// `None` for messages without a frame counterpart (binary).
    fn into_frame(self) -> Option<Frame>;

    fn from_frame(frame: Frame) -> Self;
}

impl WireMessage for axum::extract::ws::Message {
    fn into_frame(self) -> Option<Frame> {
        use axum::extract::ws::Message;
        match self {
            Message::Text(text) => Some(Frame::Text(text)),
            Message::Ping(payload) => Some(Frame::Ping(payload)),
            Message::Pong(payload) => Some(Frame::Pong(payload)),
            Message::Close(_) => Some(Frame::Close),
            _ => None,
        }
    }

    fn from_frame(frame: Frame) -> Self {
        use axum::extract::ws::Message;
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Ping(payload) => Message::Ping(payload),
            Frame::Pong(payload) => Message::Pong(payload),
            Frame::Close => Message::Close(None),
        }
    }
}

impl WireMessage for tokio_tungstenite::tungstenite::Message {
    fn into_frame(self) -> Option<Frame> {
        use tokio_tungstenite::tungstenite::Message;
        match self {
            Message::Text(text) => Some(Frame::Text(text)),
            Message::Ping(payload) => Some(Frame::Ping(payload)),
            Message::Pong(payload) => Some(Frame::Pong(payload)),
            Message::Close(_) => Some(Frame::Close),
            _ => None,
        }
    }

    fn from_frame(frame: Frame) -> Self {
        use tokio_tungstenite::tungstenite::Message;
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Ping(payload) => Message::Ping(payload),
            Frame::Pong(payload) => Message::Pong(payload),
            Frame::Close => Message::Close(None),
        }
    }
}

/// Pump a WebSocket: a reader task turns messages into frames, a writer
/// task turns frames into messages. The writer stops after `Close`.
fn socket_channel<S, M, E>(socket: S, local_addr: Option<String>, peer: String) -> FrameChannel
where
    S: Stream<Item = std::result::Result<M, E>> + Sink<M, Error = E> + Send + 'static,
    M: WireMessage,
    E: std::fmt::Display + Send + 'static,
{
    let (mut sink, mut stream) = socket.split::<M>();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

    let reader_peer = peer.clone();
    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(message) => match message.into_frame() {
                    Some(frame) => {
                        let close = frame == Frame::Close;
                        if in_tx.send(frame).is_err() || close {
                            break;
                        }
                    }
                    None => tracing::debug!(peer = %reader_peer, "Ignoring binary message"),
                },
                Err(e) => {
                    tracing::debug!(peer = %reader_peer, error = %e, "Transport read failed");
                    break;
                }
            }
        }
    });

    let writer_peer = peer.clone();
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let close = frame == Frame::Close;
            if let Err(e) = sink.send(M::from_frame(frame)).await {
                tracing::debug!(peer = %writer_peer, error = %e, "Transport write failed");
                break;
            }
            if close {
                break;
            }
        }
        let _ = sink.close().await;
    });

    FrameChannel {
        tx: FrameSender { tx: out_tx },
        rx: in_rx,
        local_addr,
        peer,
    }
}

/// Wrap an upgraded server-side WebSocket.
pub fn server_channel(socket: axum::extract::ws::WebSocket, peer: String) -> FrameChannel {
    socket_channel(socket, None, peer)
}

/// Dial step of the gateway client.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new transport.
    async fn connect(&self) -> Result<FrameChannel>;
}

/// WebSocket dialer.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    timeout: Duration,
    max_message_size: usize,
}

impl WsConnector {
    /// Dial `url` (`ws://host:port/ws`).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(10),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<FrameChannel> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);

        let connecting =
            tokio_tungstenite::connect_async_with_config(self.url.as_str(), Some(config), true);
        let (stream, _response) = tokio::time::timeout(self.timeout, connecting)
            .await
            .map_err(|_| GatewayError::Timeout(format!("connecting to {}", self.url)))?
            .map_err(|e| GatewayError::Io(format!("connecting to {}: {}", self.url, e)))?;

        let local_addr = match stream.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.local_addr().ok().map(|a| a.ip().to_string()),
            _ => None,
        };
        Ok(socket_channel(stream, local_addr, self.url.clone()))
    }
}

/// In-memory dialer: every `connect` creates a [`duplex`] pair and hands
/// the far end to whoever holds the acceptor.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    acceptor: mpsc::UnboundedSender<FrameChannel>,
}

impl MemoryConnector {
    /// Create a connector and the receiver of server-side ends.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FrameChannel>) {
        let (acceptor, incoming) = mpsc::unbounded_channel();
        (Self { acceptor }, incoming)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<FrameChannel> {
        let (client, server) = duplex();
        self.acceptor
            .send(server)
            .map_err(|_| GatewayError::Io("connection refused".into()))?;
        Ok(client)
    }
}
