//! Gateway session protocol.
//!
//! A long-lived, authenticated, bidirectional session between a gateway
//! ([`GatewayClient`]) and a central server ([`GatewayServer`]). Messages
//! are JSON objects tagged by `messageType` sent as WebSocket text messages;
//! liveness uses WebSocket ping/pong whose payload is the plcId.
//!
//! ```text
//! gateway                               server
//!    │ ── Authentication ─────────────────► │
//!    │ ◄──────────── AuthenticationResponse │
//!    │ ── PlcNotification (buffered flush) ►│
//!    │ ── ping(plcId) ────────────────────► │
//!    │ ◄──────────────────────── PlcTelegram│
//!    │ ── PlcTelegramResponse ────────────► │
//! ```

pub mod buffer;
pub mod client;
pub mod message;
pub mod pending;
pub mod server;
pub mod transport;

pub use buffer::NotificationBuffer;
pub use client::{ClientState, ClientStatus, GatewayClient};
pub use message::GatewayMessage;
pub use pending::{PendingResponses, ResponseState, TelegramOutcome, TelegramReceipt};
pub use server::{
    Authenticator, GatewayServer, RemoteListener, SessionInfo, StaticAuthenticator, WS_PATH,
};
pub use transport::{
    duplex, server_channel, Connector, Frame, FrameChannel, FrameSender, MemoryConnector,
    WsConnector, DEFAULT_MAX_MESSAGE_SIZE,
};
