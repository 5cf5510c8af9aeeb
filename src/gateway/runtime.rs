//! Dispatch engine.
//!
//! The [`Runtime`] owns every connection, the raw-address routing table, the
//! notification mapping and (a shared handle to) the listener registry. It
//! delivers hardware events to listeners along two paths:
//!
//! - **Synchronous**: [`EventSink::sync_notify`] delivers on the caller.
//! - **Queued**: [`EventSink::notify`] appends to an unbounded FIFO drained
//!   by one worker task, giving a global total order over queued events.
//!
//! Commands go the other way: [`Runtime::send`] resolves the owning
//! connection, connects it lazily once if needed, writes the hardware value
//! and then delivers the logical value synchronously.
//!
//! # Example
//!
//! ```rust,ignore
//! let runtime = RuntimeBuilder::new(listeners)
//!     .connection(plc.clone())
//!     .address(conveyor_on, Some("plc1"))
//!     .build()?;
//! runtime.start().await?;
//! runtime.send("Conveyor", "On", None).await?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::address::{AddressKind, AddressTable, LogicalAddress, LogicalKey};
use crate::core::data::Value;
use crate::core::error::{GatewayError, Result};
use crate::core::logging::LogContext;
use crate::core::traits::{AddressListener, Connection, ConnectionStatus, EventSink};

use super::listeners::{panic_message, ListenerRegistry};

/// Observes every delivered value after the listeners ran.
///
/// The Handler installs one to persist values and keep its last-value cache.
pub trait ValueObserver: Send + Sync {
    /// A value was delivered for `address`.
    fn value_delivered(&self, address: &Arc<LogicalAddress>, value: &Value);

    /// A connection changed state.
    fn connection_state_changed(&self, _connection_id: &str, _status: &ConnectionStatus) {}
}

/// Raw hardware address → notification address, at most one per raw address.
#[derive(Debug, Default, Clone)]
pub struct NotificationMapping {
    by_raw: HashMap<String, Arc<LogicalAddress>>,
}

impl NotificationMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mapping. A second mapping for the same raw address is a
    /// configuration error and leaves the first in place.
    pub fn insert(&mut self, address: Arc<LogicalAddress>) -> Result<()> {
        if address.kind != AddressKind::Notification {
            return Err(GatewayError::Config(format!(
                "{} is a {} address and cannot be a notification mapping",
                address.key, address.kind
            )));
        }
        if let Some(existing) = self.by_raw.get(&address.raw_address) {
            return Err(GatewayError::Config(format!(
                "raw address {} is already mapped to {}, cannot map {}",
                address.raw_address, existing.key, address.key
            )));
        }
        self.by_raw.insert(address.raw_address.clone(), address);
        Ok(())
    }

    pub fn get(&self, raw_address: &str) -> Option<&Arc<LogicalAddress>> {
        self.by_raw.get(raw_address)
    }

    pub fn len(&self) -> usize {
        self.by_raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_raw.is_empty()
    }
}

/// A virtual address and the listener that backs it.
#[derive(Clone)]
struct VirtualBinding {
    address: Arc<LogicalAddress>,
    listener: Arc<dyn AddressListener>,
}

enum Command {
    Event { raw_address: String, value: Value },
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Builds a [`Runtime`] and checks the routing invariants.
pub struct RuntimeBuilder {
    listeners: Arc<ListenerRegistry>,
    log: LogContext,
    queue_warn_threshold: usize,
    connections: Vec<Arc<dyn Connection>>,
    addresses: Vec<(LogicalAddress, Option<String>)>,
}

impl RuntimeBuilder {
    /// Start a builder around a (possibly shared) listener registry.
    pub fn new(listeners: Arc<ListenerRegistry>) -> Self {
        Self {
            listeners,
            log: LogContext::default(),
            queue_warn_threshold: 10_000,
            connections: Vec::new(),
            addresses: Vec::new(),
        }
    }

    /// Set the state log.
    pub fn log(mut self, log: LogContext) -> Self {
        self.log = log;
        self
    }

    /// Warn when the queue grows beyond `threshold`.
    pub fn queue_warn_threshold(mut self, threshold: usize) -> Self {
        self.queue_warn_threshold = threshold;
        self
    }

    /// Add a connection.
    pub fn connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connections.push(connection);
        self
    }

    /// Add an address owned by `connection` (`None` for virtual addresses).
    pub fn address(mut self, address: LogicalAddress, connection: Option<&str>) -> Self {
        self.addresses
            .push((address, connection.map(str::to_string)));
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<Runtime> {
        let mut connections = BTreeMap::new();
        let mut routing: HashMap<String, String> = HashMap::new();

        for conn in self.connections {
            let id = conn.id().to_string();
            for raw in conn.addresses() {
                if let Some(owner) = routing.get(&raw) {
                    return Err(GatewayError::Config(format!(
                        "raw address {} is owned by both {} and {}",
                        raw, owner, id
                    )));
                }
                routing.insert(raw, id.clone());
            }
            if connections.insert(id.clone(), conn).is_some() {
                return Err(GatewayError::Config(format!("duplicate connection id {}", id)));
            }
        }

        let mut table = AddressTable::new();
        let mut notifications = NotificationMapping::new();
        let mut owners = HashMap::new();

        for (address, connection) in self.addresses {
            match (&connection, address.is_virtual) {
                (Some(_), true) => {
                    return Err(GatewayError::Config(format!(
                        "virtual address {} must not name a connection",
                        address.key
                    )));
                }
                (None, false) => {
                    return Err(GatewayError::Config(format!(
                        "address {} has no connection",
                        address.key
                    )));
                }
                _ => {}
            }

            if let Some(conn_id) = &connection {
                if !connections.contains_key(conn_id) {
                    return Err(GatewayError::Config(format!(
                        "address {} refers to unknown connection {}",
                        address.key, conn_id
                    )));
                }
                match routing.get(&address.raw_address) {
                    Some(owner) if owner == conn_id => {}
                    _ => {
                        return Err(GatewayError::Config(format!(
                            "raw address {} of {} is not owned by connection {}",
                            address.raw_address, address.key, conn_id
                        )));
                    }
                }
            }

            let address = table.insert(address)?;
            if address.kind == AddressKind::Notification && !address.is_virtual {
                notifications.insert(Arc::clone(&address))?;
            }
            if let Some(conn_id) = connection {
                owners.insert(address.key.clone(), conn_id);
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(RuntimeInner {
            connections,
            owners,
            addresses: table,
            notifications,
            virtuals: DashMap::new(),
            listeners: self.listeners,
            observer: RwLock::new(None),
            tx,
            rx: Mutex::new(Some(rx)),
            depth: AtomicUsize::new(0),
            warn_threshold: self.queue_warn_threshold,
            warned: AtomicBool::new(false),
            running: AtomicBool::new(false),
            log: self.log,
        });

        let sink: Arc<dyn EventSink> = Arc::new(RuntimeSink {
            inner: Arc::downgrade(&inner),
        });
        for conn in inner.connections.values() {
            conn.bind(Arc::clone(&sink));
        }

        Ok(Runtime {
            inner,
            worker: Mutex::new(None),
        })
    }
}

struct RuntimeInner {
    connections: BTreeMap<String, Arc<dyn Connection>>,
    /// Logical key → owning connection id.
    owners: HashMap<LogicalKey, String>,
    addresses: AddressTable,
    notifications: NotificationMapping,
    virtuals: DashMap<LogicalKey, VirtualBinding>,
    listeners: Arc<ListenerRegistry>,
    observer: RwLock<Option<Arc<dyn ValueObserver>>>,
    tx: mpsc::UnboundedSender<Command>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    depth: AtomicUsize,
    warn_threshold: usize,
    warned: AtomicBool,
    running: AtomicBool,
    log: LogContext,
}

impl RuntimeInner {
    fn observer(&self) -> Option<Arc<dyn ValueObserver>> {
        self.observer.read().ok().and_then(|o| o.clone())
    }

    fn enqueue(&self, raw_address: &str, value: Value) {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        if depth > self.warn_threshold && !self.warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                depth,
                threshold = self.warn_threshold,
                "Notification queue is growing; a listener may be stalled"
            );
        }

        let cmd = Command::Event {
            raw_address: raw_address.to_string(),
            value,
        };
        if self.tx.send(cmd).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn dequeued(&self) {
        let depth = self.depth.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        if depth <= self.warn_threshold {
            self.warned.store(false, Ordering::Relaxed);
        }
    }

    /// Hardware event: map, coerce, invert, deliver. Unmapped addresses and
    /// unconvertible values are logged and dropped.
    fn deliver_raw(&self, raw_address: &str, value: Value) {
        let Some(address) = self.notifications.get(raw_address) else {
            self.log.unmapped_address(raw_address);
            return;
        };
        let value = match address.value_type.coerce(value) {
            Ok(value) => value,
            Err(e) => {
                self.log.value_rejected(raw_address, &address.key, e.to_string());
                return;
            }
        };
        let value = address.apply_inversion(value);
        self.deliver(address, &value);
    }

    fn deliver(&self, address: &Arc<LogicalAddress>, value: &Value) {
        self.listeners.deliver(address, value, &self.log);
        if let Some(observer) = self.observer() {
            observer.value_delivered(address, value);
        }
    }

    fn invoke_virtual(&self, binding: &VirtualBinding, value: &Value) -> Result<()> {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            binding.listener.on_value(&binding.address, value)
        }));
        let result = match result {
            Ok(r) => r,
            Err(panic) => Err(GatewayError::Listener(panic_message(&panic))),
        };

        match result {
            Ok(()) => {
                if let Some(observer) = self.observer() {
                    observer.value_delivered(&binding.address, value);
                }
                Ok(())
            }
            Err(e) => {
                self.log.listener_failed(&binding.address.key, e.to_string());
                Err(e)
            }
        }
    }

    fn state_changed(&self, connection_id: &str, status: ConnectionStatus) {
        self.log.connection_state(connection_id, &status);
        if let Some(observer) = self.observer() {
            observer.connection_state_changed(connection_id, &status);
        }
    }
}

/// The [`EventSink`] handed to connections.
///
/// Holds the runtime weakly so connections do not keep it alive.
struct RuntimeSink {
    inner: Weak<RuntimeInner>,
}

impl EventSink for RuntimeSink {
    fn notify(&self, raw_address: &str, value: Value) {
        if let Some(inner) = self.inner.upgrade() {
            inner.enqueue(raw_address, value);
        }
    }

    fn sync_notify(&self, raw_address: &str, value: Value) {
        if let Some(inner) = self.inner.upgrade() {
            inner.deliver_raw(raw_address, value);
        }
    }

    fn state_changed(&self, connection_id: &str, status: ConnectionStatus) {
        if let Some(inner) = self.inner.upgrade() {
            inner.state_changed(connection_id, status);
        }
    }
}

/// The dispatch engine.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
    worker: Mutex<Option<JoinHandle<mpsc::UnboundedReceiver<Command>>>>,
}

impl Runtime {
    /// Start the queue worker and connect auto-connect connections.
    ///
    /// A connection that fails to connect is left Failed; it is retried
    /// lazily by the next `send`.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::InvalidState("runtime already started".into()));
        }

        let rx = self
            .inner
            .rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or_else(|| GatewayError::InvalidState("queue worker already running".into()))?;

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_worker(inner, rx));
        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(handle);
        }

        for conn in self.inner.connections.values() {
            if !conn.auto_connect() {
                continue;
            }
            if let Err(e) = conn.connect().await {
                tracing::warn!(connection = %conn.id(), error = %e, "Auto-connect failed");
            }
        }

        tracing::info!(
            connections = self.inner.connections.len(),
            addresses = self.inner.addresses.len(),
            "Runtime started"
        );
        Ok(())
    }

    /// Drain the queue, stop the worker and disconnect every connection.
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.flush().await;
        let _ = self.inner.tx.send(Command::Shutdown);

        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            match handle.await {
                Ok(rx) => {
                    if let Ok(mut slot) = self.inner.rx.lock() {
                        *slot = Some(rx);
                    }
                }
                Err(e) => tracing::error!(error = %e, "Queue worker terminated abnormally"),
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);

        for conn in self.inner.connections.values() {
            if let Err(e) = conn.disconnect().await {
                tracing::warn!(connection = %conn.id(), error = %e, "Disconnect failed");
            }
        }

        tracing::info!("Runtime stopped");
        Ok(())
    }

    /// Whether the queue worker is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Resolve once every event queued before this call has been delivered.
    ///
    /// Returns immediately when the worker is not running.
    pub async fn flush(&self) {
        if !self.is_running() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.inner.tx.send(Command::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Resolve a logical address, configured or virtual.
    pub fn resolve(&self, resource: &str, action: &str) -> Result<Arc<LogicalAddress>> {
        match self.inner.addresses.resolve(resource, action) {
            Ok(address) => Ok(address),
            Err(e) => self
                .inner
                .virtuals
                .get(&LogicalKey::new(resource, action))
                .map(|b| Arc::clone(&b.address))
                .ok_or(e),
        }
    }

    /// Configured addresses.
    pub fn addresses(&self) -> impl Iterator<Item = &Arc<LogicalAddress>> {
        self.inner.addresses.iter()
    }

    /// Notification mapping.
    pub fn notifications(&self) -> &NotificationMapping {
        &self.inner.notifications
    }

    /// Shared listener registry.
    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.inner.listeners
    }

    /// Look up a connection.
    pub fn connection(&self, id: &str) -> Option<Arc<dyn Connection>> {
        self.inner.connections.get(id).cloned()
    }

    /// Connection ids in order.
    pub fn connection_ids(&self) -> Vec<String> {
        self.inner.connections.keys().cloned().collect()
    }

    /// `(id, status)` for every connection.
    pub fn connection_statuses(&self) -> Vec<(String, ConnectionStatus)> {
        self.inner
            .connections
            .iter()
            .map(|(id, conn)| (id.clone(), conn.status()))
            .collect()
    }

    /// Explicitly connect a connection (required for non-auto-connect ones).
    pub async fn connect(&self, id: &str) -> Result<()> {
        let conn = self
            .connection(id)
            .ok_or_else(|| GatewayError::Config(format!("unknown connection {}", id)))?;
        conn.connect().await
    }

    /// Explicitly disconnect a connection.
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        let conn = self
            .connection(id)
            .ok_or_else(|| GatewayError::Config(format!("unknown connection {}", id)))?;
        conn.disconnect().await
    }

    /// Install the value observer, replacing any previous one.
    pub fn set_observer(&self, observer: Arc<dyn ValueObserver>) {
        if let Ok(mut slot) = self.inner.observer.write() {
            *slot = Some(observer);
        }
    }

    /// Current queue depth.
    pub fn queue_depth(&self) -> usize {
        self.inner.depth.load(Ordering::Relaxed)
    }

    /// Send a command by logical name. Returns the logical value delivered.
    pub async fn send(&self, resource: &str, action: &str, value: Option<Value>) -> Result<Value> {
        let address = self.resolve(resource, action)?;
        self.send_address(&address, value).await
    }

    /// Send a command to a resolved address.
    pub async fn send_address(
        &self,
        address: &Arc<LogicalAddress>,
        value: Option<Value>,
    ) -> Result<Value> {
        let value = address.value_or_default(value)?;

        if address.is_virtual {
            let binding = self.virtual_binding(&address.key)?;
            self.inner.invoke_virtual(&binding, &value)?;
            return Ok(value);
        }

        let conn = self.owner(address)?;
        if !conn.status().state.is_connected() {
            if !conn.auto_connect() {
                return Err(GatewayError::NotConnected(conn.id().to_string()));
            }
            tracing::debug!(connection = %conn.id(), "Lazy connect before send");
            conn.connect().await?;
        }

        let hardware_value = address.apply_inversion(value.clone());
        conn.send(&address.raw_address, &hardware_value).await?;
        tracing::debug!(
            address = %address.key,
            connection = %conn.id(),
            value = %value,
            "Telegram sent"
        );

        self.inner.deliver(address, &value);
        Ok(value)
    }

    /// Inject a logical value for a notification address without touching
    /// hardware. Delivered on the caller.
    pub fn notify(&self, resource: &str, action: &str, value: Value) -> Result<()> {
        let address = self.resolve(resource, action)?;
        if address.kind != AddressKind::Notification {
            return Err(GatewayError::InvalidState(format!(
                "{} is a {} address; only notifications can be injected",
                address.key, address.kind
            )));
        }
        let value = address.value_type.coerce(value)?;

        if address.is_virtual {
            let binding = self.virtual_binding(&address.key)?;
            return self.inner.invoke_virtual(&binding, &value);
        }

        self.inner.deliver(&address, &value);
        Ok(())
    }

    /// Queue a hardware event by raw address.
    pub fn queue_notify(&self, raw_address: &str, value: Value) {
        self.inner.enqueue(raw_address, value);
    }

    /// Deliver a hardware event by raw address on the caller.
    pub fn sync_notify(&self, raw_address: &str, value: Value) {
        self.inner.deliver_raw(raw_address, value);
    }

    /// Back a virtual address with `listener`.
    ///
    /// A configured virtual address is bound in place. An unknown key adds
    /// a synthetic virtual address. Binding a physical address fails.
    pub fn bind_virtual(
        &self,
        address: LogicalAddress,
        listener: Arc<dyn AddressListener>,
    ) -> Result<Arc<LogicalAddress>> {
        let address = match self.inner.addresses.get(&address.key) {
            Some(existing) if existing.is_virtual => existing,
            Some(existing) => {
                return Err(GatewayError::Config(format!(
                    "{} is mapped to {} and cannot be virtual",
                    existing.key, existing.raw_address
                )));
            }
            None => Arc::new(address.with_virtual(true)),
        };

        self.inner.virtuals.insert(
            address.key.clone(),
            VirtualBinding {
                address: Arc::clone(&address),
                listener,
            },
        );
        Ok(address)
    }

    /// Remove a virtual binding.
    pub fn unbind_virtual(&self, key: &LogicalKey) -> bool {
        self.inner.virtuals.remove(key).is_some()
    }

    fn virtual_binding(&self, key: &LogicalKey) -> Result<VirtualBinding> {
        self.inner
            .virtuals
            .get(key)
            .map(|b| b.value().clone())
            .ok_or_else(|| {
                GatewayError::InvalidState(format!("virtual address {} has no listener", key))
            })
    }

    fn owner(&self, address: &LogicalAddress) -> Result<Arc<dyn Connection>> {
        self.inner
            .owners
            .get(&address.key)
            .and_then(|id| self.inner.connections.get(id))
            .cloned()
            .ok_or_else(|| {
                GatewayError::Config(format!("no connection owns {}", address.key))
            })
    }
}

async fn run_worker(
    inner: Arc<RuntimeInner>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) -> mpsc::UnboundedReceiver<Command> {
    tracing::debug!("Queue worker started");
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Event { raw_address, value } => {
                inner.deliver_raw(&raw_address, value);
                inner.dequeued();
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
            Command::Shutdown => break,
        }
    }
    tracing::debug!("Queue worker stopped");
    rx
}
