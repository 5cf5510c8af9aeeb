//! Shared connection behavior.
//!
//! [`ConnectionBase`] holds what every driver needs: identity, the fixed
//! raw-address set, the auto-connect flag, the status cell and the bound
//! runtime callback. Drivers embed it and delegate the bookkeeping parts of
//! [`Connection`](crate::core::traits::Connection) to it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::core::data::Value;
use crate::core::traits::{ConnectionState, ConnectionStatus, Diagnostics, EventSink};

/// Composable base for connection implementations.
pub struct ConnectionBase {
    id: String,
    kind: &'static str,
    addresses: HashSet<String>,
    auto_connect: bool,
    status: RwLock<ConnectionStatus>,
    sink: RwLock<Option<Arc<dyn EventSink>>>,
    write_count: AtomicU64,
    event_count: AtomicU64,
    error_count: AtomicU64,
    last_error: RwLock<Option<String>>,
}

impl ConnectionBase {
    /// Create a disconnected base.
    pub fn new(
        id: impl Into<String>,
        kind: &'static str,
        addresses: HashSet<String>,
        auto_connect: bool,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            addresses,
            auto_connect,
            status: RwLock::new(ConnectionStatus::disconnected()),
            sink: RwLock::new(None),
            write_count: AtomicU64::new(0),
            event_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_error: RwLock::new(None),
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Driver name.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Auto-connect flag.
    pub fn auto_connect(&self) -> bool {
        self.auto_connect
    }

    /// Owned raw addresses.
    pub fn addresses(&self) -> HashSet<String> {
        self.addresses.clone()
    }

    /// Whether `raw_address` belongs to this connection.
    pub fn owns(&self, raw_address: &str) -> bool {
        self.addresses.contains(raw_address)
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|_| ConnectionStatus::failed("status lock poisoned"))
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    /// Attach the runtime callback.
    pub fn bind(&self, sink: Arc<dyn EventSink>) {
        if let Ok(mut slot) = self.sink.write() {
            *slot = Some(sink);
        }
    }

    fn sink(&self) -> Option<Arc<dyn EventSink>> {
        self.sink.read().ok().and_then(|s| s.clone())
    }

    /// Replace the status; reports the transition upward when it changed.
    pub fn set_status(&self, status: ConnectionStatus) {
        let changed = match self.status.write() {
            Ok(mut current) => {
                let changed = *current != status;
                *current = status.clone();
                changed
            }
            Err(_) => false,
        };

        if changed {
            if let Some(sink) = self.sink() {
                sink.state_changed(&self.id, status);
            }
        }
    }

    /// Transition to Connected.
    pub fn mark_connected(&self) {
        self.set_status(ConnectionStatus::connected());
    }

    /// Transition to Disconnected.
    pub fn mark_disconnected(&self) {
        self.set_status(ConnectionStatus::disconnected());
    }

    /// Transition to Failed with a reason.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        self.record_error(&message);
        self.set_status(ConnectionStatus::failed(message));
    }

    /// Count an error without changing state.
    pub fn record_error(&self, message: &str) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error.write() {
            *last = Some(message.to_string());
        }
    }

    /// Count a successful write.
    pub fn record_write(&self) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Report a hardware event through the queued path.
    pub fn notify(&self, raw_address: &str, value: Value) {
        self.event_count.fetch_add(1, Ordering::Relaxed);
        if let Some(sink) = self.sink() {
            sink.notify(raw_address, value);
        }
    }

    /// Report a hardware event through the synchronous path.
    pub fn sync_notify(&self, raw_address: &str, value: Value) {
        self.event_count.fetch_add(1, Ordering::Relaxed);
        if let Some(sink) = self.sink() {
            sink.sync_notify(raw_address, value);
        }
    }

    /// Diagnostics snapshot.
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            connection_id: self.id.clone(),
            kind: self.kind.to_string(),
            state: self.state(),
            write_count: self.write_count.load(Ordering::Relaxed),
            event_count: self.event_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_error: self.last_error.read().ok().and_then(|e| e.clone()),
        }
    }
}
