//! Core traits for connections and listeners.
//!
//! # Trait Hierarchy
//!
//! ```text
//! Connection      // one physical or virtual transport (driver boundary)
//!   └── bound to an EventSink   // callback into the runtime
//! AddressListener // receives delivered values for one logical address
//! ```
//!
//! Concrete drivers implement [`Connection`] and are otherwise opaque to the
//! runtime. They report hardware events and state transitions through the
//! [`EventSink`] handed to them by [`Connection::bind`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::address::LogicalAddress;
use crate::core::data::Value;
use crate::core::error::Result;

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected to the target.
    #[default]
    Disconnected,

    /// Connected and operational.
    Connected,

    /// An unexpected I/O failure occurred.
    Failed,
}

impl ConnectionState {
    /// Check if currently connected.
    #[inline]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if a (re)connect attempt makes sense.
    #[inline]
    pub const fn can_retry(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "Disconnected",
            Self::Connected => "Connected",
            Self::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

/// Queryable state plus operator-facing message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Current state.
    pub state: ConnectionState,

    /// Message describing the last transition (failure reason, etc.).
    pub message: Option<String>,
}

impl ConnectionStatus {
    /// Create a status.
    pub fn new(state: ConnectionState, message: Option<String>) -> Self {
        Self { state, message }
    }

    /// Connected, no message.
    pub fn connected() -> Self {
        Self::new(ConnectionState::Connected, None)
    }

    /// Disconnected, no message.
    pub fn disconnected() -> Self {
        Self::new(ConnectionState::Disconnected, None)
    }

    /// Failed with a reason.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ConnectionState::Failed, Some(message.into()))
    }
}

/// Connection diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Connection identifier.
    pub connection_id: String,

    /// Connection kind (driver name).
    pub kind: String,

    /// Current state.
    pub state: ConnectionState,

    /// Number of successful writes.
    pub write_count: u64,

    /// Number of hardware events reported.
    pub event_count: u64,

    /// Number of errors.
    pub error_count: u64,

    /// Last error message.
    pub last_error: Option<String>,
}

/// Callback from a connection into the runtime.
///
/// Implemented by the runtime; drivers only call it.
pub trait EventSink: Send + Sync {
    /// Queue a hardware event for ordered delivery by the dispatch worker.
    fn notify(&self, raw_address: &str, value: Value);

    /// Deliver a hardware event on the calling thread.
    fn sync_notify(&self, raw_address: &str, value: Value);

    /// Report a connection state transition.
    fn state_changed(&self, connection_id: &str, status: ConnectionStatus);
}

/// One physical or virtual transport.
///
/// `connect` and `send` may block on real I/O; timeouts are the
/// implementation's responsibility.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Connection identifier.
    fn id(&self) -> &str;

    /// Driver name, e.g. `"simulated"`.
    fn kind(&self) -> &'static str;

    /// Whether the runtime connects this connection on start and lazily on send.
    fn auto_connect(&self) -> bool;

    /// Fixed set of raw addresses owned by this connection.
    fn addresses(&self) -> HashSet<String>;

    /// Current status.
    fn status(&self) -> ConnectionStatus;

    /// Attach the runtime callback. Called once, before `connect`.
    fn bind(&self, sink: Arc<dyn EventSink>);

    /// Establish the transport.
    async fn connect(&self) -> Result<()>;

    /// Tear down the transport.
    async fn disconnect(&self) -> Result<()>;

    /// Write `value` to `raw_address`.
    async fn send(&self, raw_address: &str, value: &Value) -> Result<()>;

    /// Diagnostics snapshot.
    fn diagnostics(&self) -> Diagnostics;
}

/// Receives values delivered for a logical address.
///
/// Listeners run on the delivering thread (the dispatch worker for queued
/// events, the caller for synchronous ones) and must not block for long.
/// An error or panic is logged and does not affect other listeners.
pub trait AddressListener: Send + Sync {
    /// Handle a delivered (post-inversion) value.
    fn on_value(&self, address: &LogicalAddress, value: &Value) -> Result<()>;
}

impl<F> AddressListener for F
where
    F: Fn(&LogicalAddress, &Value) -> Result<()> + Send + Sync,
{
    fn on_value(&self, address: &LogicalAddress, value: &Value) -> Result<()> {
        self(address, value)
    }
}

/// Handle returned by listener registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(pub u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::{AddressKind, LogicalKey};
    use crate::core::data::ValueType;

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Disconnected.can_retry());
        assert!(ConnectionState::Failed.can_retry());
        assert!(!ConnectionState::Connected.can_retry());
    }

    #[test]
    fn test_status_constructors() {
        let status = ConnectionStatus::failed("socket reset");
        assert_eq!(status.state, ConnectionState::Failed);
        assert_eq!(status.message.as_deref(), Some("socket reset"));
        assert_eq!(ConnectionStatus::default(), ConnectionStatus::disconnected());
    }

    #[test]
    fn test_closure_listener() {
        let listener = |_: &LogicalAddress, v: &Value| -> Result<()> {
            assert_eq!(v, &Value::Bool(true));
            Ok(())
        };
        let address = LogicalAddress::new(
            LogicalKey::new("Pump", "Running"),
            AddressKind::Notification,
            "DI.1",
            ValueType::Boolean,
        );
        listener.on_value(&address, &Value::Bool(true)).unwrap();
    }
}
