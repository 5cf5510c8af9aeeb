//! State-transition logging.
//!
//! Operators diagnose PLC connectivity through state/message pairs, so every
//! lifecycle transition (connection, handler, remote session) is emitted as a
//! typed [`StateEvent`] to a pluggable [`StateLogHandler`], in addition to
//! being queryable from the component itself.
//!
//! # Example
//!
//! ```ignore
//! use plcgw::core::logging::{LogContext, TracingLogHandler};
//!
//! let log = LogContext::new(Arc::new(TracingLogHandler));
//! log.connection_state("plc1", &ConnectionStatus::failed("socket reset"));
//! ```

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::core::address::LogicalKey;
use crate::core::traits::ConnectionStatus;

/// Component whose lifecycle changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// The handler (orchestrator).
    Handler,
    /// The gateway session client.
    Client,
    /// A server-side session for one plcId.
    Session,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handler => write!(f, "handler"),
            Self::Client => write!(f, "client"),
            Self::Session => write!(f, "session"),
        }
    }
}

/// A state transition or isolated failure worth an operator's attention.
#[derive(Debug, Clone)]
pub enum StateEvent {
    /// A connection changed state.
    ConnectionState {
        /// Event timestamp.
        timestamp: SystemTime,
        /// Connection identifier.
        connection_id: String,
        /// New status.
        status: ConnectionStatus,
    },

    /// Handler, client or server session changed state.
    Lifecycle {
        /// Event timestamp.
        timestamp: SystemTime,
        /// Which component.
        component: Component,
        /// Component instance name (plcId for sessions).
        name: String,
        /// New state name.
        state: String,
        /// Diagnostic message.
        message: Option<String>,
    },

    /// A listener returned an error or panicked.
    ListenerFailed {
        /// Event timestamp.
        timestamp: SystemTime,
        /// Address being delivered.
        key: LogicalKey,
        /// Error description.
        error: String,
    },

    /// A hardware event arrived for a raw address with no notification mapping.
    UnmappedAddress {
        /// Event timestamp.
        timestamp: SystemTime,
        /// The raw address.
        raw_address: String,
    },

    /// A hardware value did not convert to the declared type of its address.
    ValueRejected {
        /// Event timestamp.
        timestamp: SystemTime,
        /// The raw address.
        raw_address: String,
        /// Address the value was mapped to.
        key: LogicalKey,
        /// Conversion error.
        error: String,
    },
}

impl StateEvent {
    /// Get the event timestamp.
    pub fn timestamp(&self) -> SystemTime {
        match self {
            Self::ConnectionState { timestamp, .. } => *timestamp,
            Self::Lifecycle { timestamp, .. } => *timestamp,
            Self::ListenerFailed { timestamp, .. } => *timestamp,
            Self::UnmappedAddress { timestamp, .. } => *timestamp,
            Self::ValueRejected { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConnectionState { .. } => "connection_state",
            Self::Lifecycle { .. } => "lifecycle",
            Self::ListenerFailed { .. } => "listener_failed",
            Self::UnmappedAddress { .. } => "unmapped_address",
            Self::ValueRejected { .. } => "value_rejected",
        }
    }
}

/// Receiver of state events.
///
/// Called synchronously on the thread that observed the transition.
pub trait StateLogHandler: Send + Sync {
    /// Handle an event.
    fn on_event(&self, event: &StateEvent);
}

/// Discards everything.
pub struct NoopLogHandler;

impl StateLogHandler for NoopLogHandler {
    fn on_event(&self, _event: &StateEvent) {}
}

/// Emits events as `tracing` records.
pub struct TracingLogHandler;

impl StateLogHandler for TracingLogHandler {
    fn on_event(&self, event: &StateEvent) {
        use tracing::{debug, info, warn};

        match event {
            StateEvent::ConnectionState {
                connection_id,
                status,
                ..
            } => match &status.message {
                Some(message) => warn!(
                    connection = %connection_id,
                    state = %status.state,
                    detail = %message,
                    "Connection state changed"
                ),
                None => info!(
                    connection = %connection_id,
                    state = %status.state,
                    "Connection state changed"
                ),
            },
            StateEvent::Lifecycle {
                component,
                name,
                state,
                message,
                ..
            } => info!(
                component = %component,
                name = %name,
                state = %state,
                detail = message.as_deref().unwrap_or(""),
                "Lifecycle state changed"
            ),
            StateEvent::ListenerFailed { key, error, .. } => warn!(
                address = %key,
                error = %error,
                "Listener failed during delivery"
            ),
            StateEvent::UnmappedAddress { raw_address, .. } => debug!(
                raw_address = %raw_address,
                "No notification mapping for raw address"
            ),
            StateEvent::ValueRejected {
                raw_address,
                key,
                error,
                ..
            } => warn!(
                raw_address = %raw_address,
                address = %key,
                error = %error,
                "Dropping hardware value of the wrong type"
            ),
        }
    }
}

/// Fans events out to several handlers.
#[derive(Default)]
pub struct CompositeLogHandler {
    handlers: Vec<Arc<dyn StateLogHandler>>,
}

impl CompositeLogHandler {
    /// Create an empty composite handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler (builder style).
    pub fn add(mut self, handler: Arc<dyn StateLogHandler>) -> Self {
        self.handlers.push(handler);
        self
    }
}

impl StateLogHandler for CompositeLogHandler {
    fn on_event(&self, event: &StateEvent) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Keeps every event in memory. Used by tests and diagnostics endpoints.
#[derive(Default)]
pub struct RecordingLogHandler {
    events: Mutex<Vec<StateEvent>>,
}

impl RecordingLogHandler {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events.
    pub fn events(&self) -> Vec<StateEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl StateLogHandler for RecordingLogHandler {
    fn on_event(&self, event: &StateEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Cheaply cloneable logging entry point used by the runtime and sessions.
#[derive(Clone)]
pub struct LogContext {
    handler: Arc<dyn StateLogHandler>,
}

impl Default for LogContext {
    fn default() -> Self {
        Self::new(Arc::new(TracingLogHandler))
    }
}

impl LogContext {
    /// Create a context around a handler.
    pub fn new(handler: Arc<dyn StateLogHandler>) -> Self {
        Self { handler }
    }

    /// Emit an arbitrary event.
    pub fn log(&self, event: StateEvent) {
        self.handler.on_event(&event);
    }

    /// Connection status transition.
    pub fn connection_state(&self, connection_id: &str, status: &ConnectionStatus) {
        self.log(StateEvent::ConnectionState {
            timestamp: SystemTime::now(),
            connection_id: connection_id.to_string(),
            status: status.clone(),
        });
    }

    /// Lifecycle transition of a handler, client or session.
    pub fn lifecycle(
        &self,
        component: Component,
        name: &str,
        state: impl std::fmt::Display,
        message: Option<&str>,
    ) {
        self.log(StateEvent::Lifecycle {
            timestamp: SystemTime::now(),
            component,
            name: name.to_string(),
            state: state.to_string(),
            message: message.map(str::to_string),
        });
    }

    /// Isolated listener failure.
    pub fn listener_failed(&self, key: &LogicalKey, error: impl Into<String>) {
        self.log(StateEvent::ListenerFailed {
            timestamp: SystemTime::now(),
            key: key.clone(),
            error: error.into(),
        });
    }

    /// Hardware event on an unmapped raw address.
    pub fn unmapped_address(&self, raw_address: &str) {
        self.log(StateEvent::UnmappedAddress {
            timestamp: SystemTime::now(),
            raw_address: raw_address.to_string(),
        });
    }

    pub fn value_rejected(&self, raw_address: &str, key: &LogicalKey, error: impl Into<String>) {
        self.log(StateEvent::ValueRejected {
            timestamp: SystemTime::now(),
            raw_address: raw_address.to_string(),
            key: key.clone(),
            error: error.into(),
        });
    }
}
