//! Handler (orchestrator).
//!
//! Builds the [`Runtime`] from configuration, owns the listener registry
//! across reconfigurations, persists delivered values off the delivery path
//! and exposes `send`/`notify`/`register` by logical name.
//!
//! # Lifecycle
//!
//! ```text
//! Initial ──configure──► Configured ──start──► Started ──stop──► Stopped
//!                │                        │                        │
//!                └──────── Failed ◄───────┘          configure ◄───┘
//! ```
//!
//! Reconfiguration is rejected while Started.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use crate::core::address::{LogicalAddress, LogicalKey};
use crate::core::data::{Value, ValueChange};
use crate::core::error::{GatewayError, Result};
use crate::core::logging::{Component, LogContext};
use crate::core::traits::{AddressListener, ConnectionStatus, ListenerId};
use crate::store::{StateRecord, ValueStore};

use super::address::validate_virtual_address;
use super::config::GatewayConfig;
use super::factory::{build_runtime, ConnectionFactory};
use super::listeners::ListenerRegistry;
use super::runtime::{Runtime, ValueObserver};

/// Handler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerState {
    Initial,
    Configured,
    Started,
    Stopped,
    Failed,
}

impl std::fmt::Display for HandlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initial => "Initial",
            Self::Configured => "Configured",
            Self::Started => "Started",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

enum PersistJob {
    Value(ValueChange),
    State {
        component: &'static str,
        name: String,
        record: StateRecord,
    },
    Flush(oneshot::Sender<()>),
}

/// Feeds delivered values into the cache and the persistence queue.
struct HandlerObserver {
    cache: Arc<DashMap<LogicalKey, Value>>,
    persist: mpsc::UnboundedSender<PersistJob>,
}

impl ValueObserver for HandlerObserver {
    fn value_delivered(&self, address: &Arc<LogicalAddress>, value: &Value) {
        self.cache.insert(address.key.clone(), value.clone());
        let _ = self.persist.send(PersistJob::Value(ValueChange::new(
            address.key.clone(),
            value.clone(),
        )));
    }

    fn connection_state_changed(&self, connection_id: &str, status: &ConnectionStatus) {
        let _ = self.persist.send(PersistJob::State {
            component: "connection",
            name: connection_id.to_string(),
            record: StateRecord {
                state: status.state.to_string(),
                message: status.message.clone(),
            },
        });
    }
}

/// The orchestrator.
pub struct Handler {
    name: String,
    store: Arc<dyn ValueStore>,
    factory: ConnectionFactory,
    listeners: Arc<ListenerRegistry>,
    log: LogContext,
    state: RwLock<(HandlerState, Option<String>)>,
    runtime: RwLock<Option<Arc<Runtime>>>,
    config: RwLock<Option<GatewayConfig>>,
    virtual_listeners: Mutex<Vec<(LogicalAddress, Arc<dyn AddressListener>)>>,
    cache: Arc<DashMap<LogicalKey, Value>>,
    persist_tx: mpsc::UnboundedSender<PersistJob>,
    persist_rx: Mutex<Option<mpsc::UnboundedReceiver<PersistJob>>>,
    persist_worker: Mutex<Option<JoinHandle<()>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Handler {
    /// Create a handler with the built-in connection kinds.
    pub fn new(store: Arc<dyn ValueStore>) -> Self {
        Self::with_factory(store, ConnectionFactory::new())
    }

    /// Create a handler with a custom connection factory.
    pub fn with_factory(store: Arc<dyn ValueStore>, factory: ConnectionFactory) -> Self {
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        Self {
            name: "main".to_string(),
            store,
            factory,
            listeners: Arc::new(ListenerRegistry::new()),
            log: LogContext::default(),
            state: RwLock::new((HandlerState::Initial, None)),
            runtime: RwLock::new(None),
            config: RwLock::new(None),
            virtual_listeners: Mutex::new(Vec::new()),
            cache: Arc::new(DashMap::new()),
            persist_tx,
            persist_rx: Mutex::new(Some(persist_rx)),
            persist_worker: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Set the state log (builder style).
    pub fn with_log(mut self, log: LogContext) -> Self {
        self.log = log;
        self
    }

    /// Set the instance name used in state records.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Current state and message.
    pub fn state(&self) -> (HandlerState, Option<String>) {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or((HandlerState::Failed, Some("state lock poisoned".into())))
    }

    fn set_state(&self, state: HandlerState, message: Option<String>) {
        if let Ok(mut current) = self.state.write() {
            *current = (state, message.clone());
        }
        self.log
            .lifecycle(Component::Handler, &self.name, state, message.as_deref());
        let _ = self.persist_tx.send(PersistJob::State {
            component: "handler",
            name: self.name.clone(),
            record: StateRecord {
                state: state.to_string(),
                message,
            },
        });
    }

    fn fail(&self, error: GatewayError) -> GatewayError {
        self.set_state(HandlerState::Failed, Some(error.to_string()));
        error
    }

    /// The current runtime, if configured.
    pub fn runtime(&self) -> Option<Arc<Runtime>> {
        self.runtime.read().ok().and_then(|r| r.clone())
    }

    fn started_runtime(&self) -> Result<Arc<Runtime>> {
        let (state, _) = self.state();
        if state != HandlerState::Started {
            return Err(GatewayError::InvalidState(format!(
                "handler is {}, not Started",
                state
            )));
        }
        self.runtime()
            .ok_or_else(|| GatewayError::InvalidState("handler has no runtime".into()))
    }

    /// The active configuration.
    pub fn config(&self) -> Option<GatewayConfig> {
        self.config.read().ok().and_then(|c| c.clone())
    }

    /// Build addresses and connections from `config`.
    ///
    /// Replaces any previous runtime. Rejected while Started. A
    /// configuration error moves the handler to Failed.
    pub async fn configure(&self, config: &GatewayConfig) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let (state, _) = self.state();
        if state == HandlerState::Started {
            return Err(GatewayError::InvalidState(
                "cannot reconfigure while Started; stop first".into(),
            ));
        }

        let runtime = build_runtime(config, &self.factory, Arc::clone(&self.listeners), self.log.clone())
            .map_err(|e| self.fail(e))?;

        let virtuals = self
            .virtual_listeners
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default();
        for (address, listener) in virtuals {
            runtime
                .bind_virtual(address, listener)
                .map_err(|e| self.fail(e))?;
        }

        runtime.set_observer(Arc::new(HandlerObserver {
            cache: Arc::clone(&self.cache),
            persist: self.persist_tx.clone(),
        }));

        self.cache.clear();
        if let Ok(mut slot) = self.runtime.write() {
            *slot = Some(Arc::new(runtime));
        }
        if let Ok(mut slot) = self.config.write() {
            *slot = Some(config.clone());
        }

        tracing::info!(
            connections = config.connections.len(),
            addresses = config.addresses.len(),
            "Handler configured"
        );
        self.set_state(HandlerState::Configured, None);
        Ok(())
    }

    /// Start the runtime and the persistence worker.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let (state, _) = self.state();
        if !matches!(state, HandlerState::Configured | HandlerState::Stopped) {
            return Err(GatewayError::InvalidState(format!(
                "cannot start from {}",
                state
            )));
        }
        let runtime = self
            .runtime()
            .ok_or_else(|| GatewayError::InvalidState("handler has no runtime".into()))?;

        self.spawn_persistence();
        runtime.start().await.map_err(|e| self.fail(e))?;
        self.set_state(HandlerState::Started, None);
        Ok(())
    }

    /// Stop the runtime after draining queued events and pending writes.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let (state, _) = self.state();
        if state != HandlerState::Started {
            return Ok(());
        }
        if let Some(runtime) = self.runtime() {
            runtime.stop().await?;
        }
        self.set_state(HandlerState::Stopped, None);
        self.flush_persistence().await;
        Ok(())
    }

    /// Wait until queued events are delivered and their values persisted.
    pub async fn flush(&self) {
        if let Some(runtime) = self.runtime() {
            runtime.flush().await;
        }
        self.flush_persistence().await;
    }

    async fn flush_persistence(&self) {
        let running = self
            .persist_worker
            .lock()
            .map(|w| w.is_some())
            .unwrap_or(false);
        if !running {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.persist_tx.send(PersistJob::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn spawn_persistence(&self) {
        let rx = self.persist_rx.lock().ok().and_then(|mut rx| rx.take());
        if let Some(rx) = rx {
            let handle = tokio::spawn(run_persistence(Arc::clone(&self.store), rx));
            if let Ok(mut slot) = self.persist_worker.lock() {
                *slot = Some(handle);
            }
        }
    }

    /// Send a telegram. Returns the logical value delivered.
    pub async fn send(&self, resource: &str, action: &str, value: Option<Value>) -> Result<Value> {
        self.started_runtime()?.send(resource, action, value).await
    }

    /// Inject a value for a notification address without touching hardware.
    pub fn notify(&self, resource: &str, action: &str, value: Value) -> Result<()> {
        self.started_runtime()?.notify(resource, action, value)
    }

    /// Register a listener by logical name.
    ///
    /// Before configuration any key is accepted; afterwards the key must
    /// resolve.
    pub fn register_listener(
        &self,
        resource: &str,
        action: &str,
        listener: Arc<dyn AddressListener>,
    ) -> Result<ListenerId> {
        let key = match self.runtime() {
            Some(runtime) => runtime.resolve(resource, action)?.key.clone(),
            None => LogicalKey::new(resource, action),
        };
        Ok(self.listeners.register(key, listener))
    }

    /// Unregister a listener.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    /// Back a virtual address with `listener`.
    ///
    /// The raw address must be a valid virtual address for the declared
    /// type. The binding survives reconfiguration.
    pub fn register_virtual_listener(
        &self,
        address: LogicalAddress,
        listener: Arc<dyn AddressListener>,
    ) -> Result<()> {
        validate_virtual_address(&address.raw_address, address.value_type)?;
        let address = address.with_virtual(true);

        if let Some(runtime) = self.runtime() {
            runtime.bind_virtual(address.clone(), Arc::clone(&listener))?;
        }
        if let Ok(mut virtuals) = self.virtual_listeners.lock() {
            virtuals.retain(|(a, _)| a.key != address.key);
            virtuals.push((address, listener));
        }
        Ok(())
    }

    /// Last value delivered for an address.
    pub fn current_value(&self, resource: &str, action: &str) -> Option<Value> {
        self.cache
            .get(&LogicalKey::new(resource, action))
            .map(|v| v.value().clone())
    }

    /// Addresses flagged for remote forwarding.
    pub fn remote_addresses(&self) -> Vec<Arc<LogicalAddress>> {
        self.runtime()
            .map(|r| r.addresses().filter(|a| a.remote).cloned().collect())
            .unwrap_or_default()
    }

    /// `(id, status)` of every connection.
    pub fn connection_statuses(&self) -> Vec<(String, ConnectionStatus)> {
        self.runtime()
            .map(|r| r.connection_statuses())
            .unwrap_or_default()
    }

    /// Shared listener registry.
    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn ValueStore> {
        &self.store
    }

    /// Record a component state through the persistence worker.
    pub fn record_state(&self, component: &'static str, name: &str, state: &str, message: Option<&str>) {
        let _ = self.persist_tx.send(PersistJob::State {
            component,
            name: name.to_string(),
            record: StateRecord {
                state: state.to_string(),
                message: message.map(str::to_string),
            },
        });
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.persist_worker.lock() {
            if let Some(handle) = worker.take() {
                handle.abort();
            }
        }
    }
}

/// Persistence worker.
///
/// Every address (and every recorded component) gets its own lane: a task
/// draining that key's jobs in delivery order. A slow update only holds up
/// later updates of the same key.
async fn run_persistence(store: Arc<dyn ValueStore>, mut rx: mpsc::UnboundedReceiver<PersistJob>) {
    let mut lanes: HashMap<String, mpsc::UnboundedSender<PersistJob>> = HashMap::new();
    let mut tasks = JoinSet::new();

    while let Some(job) = rx.recv().await {
        let (lane_key, job) = match job {
            PersistJob::Flush(done) => {
                let markers: Vec<_> = lanes
                    .values()
                    .filter_map(|lane| {
                        let (done, marker) = oneshot::channel();
                        lane.send(PersistJob::Flush(done)).ok().map(|_| marker)
                    })
                    .collect();
                for marker in markers {
                    let _ = marker.await;
                }
                let _ = done.send(());
                continue;
            }
            PersistJob::Value(change) => (change.key.to_string(), PersistJob::Value(change)),
            PersistJob::State { component, name, record } => (
                format!("state:{}:{}", component, name),
                PersistJob::State { component, name, record },
            ),
        };

        let lane = lanes.entry(lane_key).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tasks.spawn(run_lane(Arc::clone(&store), rx));
            tx
        });
        let _ = lane.send(job);
    }

    drop(lanes);
    while tasks.join_next().await.is_some() {}
}

async fn run_lane(store: Arc<dyn ValueStore>, mut rx: mpsc::UnboundedReceiver<PersistJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            PersistJob::Value(change) => persist_value(store.as_ref(), &change).await,
            PersistJob::State { component, name, record } => {
                if let Err(e) = store.record_state(component, &name, record).await {
                    tracing::warn!(component, name = %name, error = %e, "Failed to persist state");
                }
            }
            PersistJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn persist_value(store: &dyn ValueStore, change: &ValueChange) {
    let result = async {
        let id = store.logical_address_id(&change.key).await?;
        store.update(id, change).await
    }
    .await;

    if let Err(e) = result {
        tracing::warn!(address = %change.key, error = %e, "Failed to persist value");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::AddressKind;
    use crate::core::data::ValueType;
    use crate::core::traits::Connection;
    use crate::gateway::config::EXAMPLE_CONFIG;
    use crate::protocols::simulated::{SimulatedConfig, SimulatedConnection};
    use crate::store::MemoryStore;

    type Seen = Arc<Mutex<Vec<Value>>>;

    fn record(seen: &Seen) -> Arc<dyn AddressListener> {
        let seen = Arc::clone(seen);
        Arc::new(move |_: &LogicalAddress, v: &Value| -> Result<()> {
            seen.lock().unwrap().push(v.clone());
            Ok(())
        })
    }

    /// Handler whose "simulated" kind hands out one shared connection.
    fn handler_with(plc: Arc<SimulatedConnection>, store: Arc<MemoryStore>) -> Handler {
        let mut factory = ConnectionFactory::empty();
        factory.register("simulated", move |_, _| Ok(plc.clone() as Arc<dyn Connection>));
        Handler::with_factory(store, factory)
    }

    fn example_plc() -> Arc<SimulatedConnection> {
        Arc::new(SimulatedConnection::new(
            SimulatedConfig::new("plc1")
                .with_addresses(["DO.1", "DI.3"])
                .with_echo_writes(true),
        ))
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let handler = Handler::new(Arc::new(MemoryStore::new()));
        assert_eq!(handler.state().0, HandlerState::Initial);
        assert!(handler.start().await.is_err());

        let config = GatewayConfig::from_toml_str(EXAMPLE_CONFIG).unwrap();
        handler.configure(&config).await.unwrap();
        assert_eq!(handler.state().0, HandlerState::Configured);

        handler.start().await.unwrap();
        assert_eq!(handler.state().0, HandlerState::Started);
        assert!(matches!(
            handler.configure(&config).await,
            Err(GatewayError::InvalidState(_))
        ));

        handler.stop().await.unwrap();
        assert_eq!(handler.state().0, HandlerState::Stopped);
        handler.configure(&config).await.unwrap();
        handler.start().await.unwrap();
        handler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_configuration_error_fails_handler() {
        let handler = Handler::new(Arc::new(MemoryStore::new()));
        let mut config = GatewayConfig::from_toml_str(EXAMPLE_CONFIG).unwrap();
        config.addresses[3].raw_address = "vbool".into();

        let err = handler.configure(&config).await.unwrap_err();
        assert!(err.is_fatal_config());
        let (state, message) = handler.state();
        assert_eq!(state, HandlerState::Failed);
        assert!(message.unwrap().contains("vbool"));
    }

    #[tokio::test]
    async fn test_conveyor_on_default_send() {
        let plc = example_plc();
        let store = Arc::new(MemoryStore::new());
        let handler = handler_with(plc.clone(), store.clone());
        handler
            .configure(&GatewayConfig::from_toml_str(EXAMPLE_CONFIG).unwrap())
            .await
            .unwrap();

        let first: Seen = Default::default();
        let second: Seen = Default::default();
        handler
            .register_listener("Conveyor", "On", record(&first))
            .unwrap();
        handler
            .register_listener("Conveyor", "On", record(&second))
            .unwrap();

        handler.start().await.unwrap();
        let value = handler.send("Conveyor", "On", None).await.unwrap();
        handler.flush().await;

        assert_eq!(value, Value::Bool(true));
        assert_eq!(plc.written("DO.1"), Some(Value::Bool(true)));
        assert_eq!(*first.lock().unwrap(), vec![Value::Bool(true)]);
        assert_eq!(*second.lock().unwrap(), vec![Value::Bool(true)]);

        assert_eq!(handler.current_value("Conveyor", "On"), Some(Value::Bool(true)));
        let stored = store.value_of(&LogicalKey::new("Conveyor", "On")).unwrap();
        assert_eq!(stored.value, Value::Bool(true));
        // the echo is delivered to the notification sharing DO.1
        assert_eq!(
            handler.current_value("Conveyor", "Running"),
            Some(Value::Bool(true))
        );
    }

    #[tokio::test]
    async fn test_virtual_plc_running() {
        let plc = example_plc();
        let handler = handler_with(plc.clone(), Arc::new(MemoryStore::new()));

        let bound: Seen = Default::default();
        handler
            .register_virtual_listener(
                LogicalAddress::new(
                    LogicalKey::new("PLC", "Running"),
                    AddressKind::Telegram,
                    "vbool.running",
                    ValueType::Boolean,
                ),
                record(&bound),
            )
            .unwrap();

        handler
            .configure(&GatewayConfig::from_toml_str(EXAMPLE_CONFIG).unwrap())
            .await
            .unwrap();
        handler.start().await.unwrap();
        handler
            .send("PLC", "Running", Some(Value::Bool(true)))
            .await
            .unwrap();

        assert_eq!(*bound.lock().unwrap(), vec![Value::Bool(true)]);
        assert!(plc.write_log().is_empty());
    }

    #[tokio::test]
    async fn test_bare_virtual_prefix_rejected() {
        let handler = Handler::new(Arc::new(MemoryStore::new()));
        let result = handler.register_virtual_listener(
            LogicalAddress::new(
                LogicalKey::new("PLC", "Running"),
                AddressKind::Telegram,
                "vbool.",
                ValueType::Boolean,
            ),
            Arc::new(|_: &LogicalAddress, _: &Value| -> Result<()> { Ok(()) }),
        );
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[tokio::test]
    async fn test_listeners_survive_reconfiguration() {
        let plc = example_plc();
        let handler = handler_with(plc.clone(), Arc::new(MemoryStore::new()));
        let seen: Seen = Default::default();

        // registered before any configuration
        handler
            .register_listener("Door", "Closed", record(&seen))
            .unwrap();

        let config = GatewayConfig::from_toml_str(EXAMPLE_CONFIG).unwrap();
        handler.configure(&config).await.unwrap();
        handler.start().await.unwrap();
        handler.stop().await.unwrap();
        handler.configure(&config).await.unwrap();
        handler.start().await.unwrap();

        // DI.3 is inverted
        plc.inject("DI.3", false);
        handler.flush().await;
        assert_eq!(*seen.lock().unwrap(), vec![Value::Bool(true)]);

        assert!(matches!(
            handler.register_listener("Door", "Missing", record(&seen)),
            Err(GatewayError::UnknownAddress { .. })
        ));
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_affect_delivery() {
        let plc = example_plc();
        let store = Arc::new(MemoryStore::new());
        store.set_fail_updates(true);
        let handler = handler_with(plc.clone(), store.clone());
        handler
            .configure(&GatewayConfig::from_toml_str(EXAMPLE_CONFIG).unwrap())
            .await
            .unwrap();
        let seen: Seen = Default::default();
        handler
            .register_listener("Conveyor", "On", record(&seen))
            .unwrap();
        handler.start().await.unwrap();

        handler.send("Conveyor", "On", None).await.unwrap();
        handler.flush().await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(store.is_empty());
    }

    /// Holds updates of one key until released.
    struct GatedStore {
        inner: MemoryStore,
        gated: LogicalKey,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait::async_trait]
    impl ValueStore for GatedStore {
        async fn logical_address_id(&self, key: &LogicalKey) -> Result<crate::store::StorageId> {
            self.inner.logical_address_id(key).await
        }

        async fn update(&self, id: crate::store::StorageId, change: &ValueChange) -> Result<()> {
            if change.key == self.gated {
                let _permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|e| GatewayError::Store(e.to_string()))?;
            }
            self.inner.update(id, change).await
        }

        async fn read(
            &self,
            id: crate::store::StorageId,
        ) -> Result<Option<crate::store::StoredValue>> {
            self.inner.read(id).await
        }

        async fn record_state(&self, component: &str, name: &str, record: StateRecord) -> Result<()> {
            self.inner.record_state(component, name, record).await
        }

        async fn read_state(&self, component: &str, name: &str) -> Result<Option<StateRecord>> {
            self.inner.read_state(component, name).await
        }
    }

    #[tokio::test]
    async fn test_slow_update_does_not_block_other_addresses() {
        let plc = example_plc();
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new(),
            gated: LogicalKey::new("Conveyor", "On"),
            gate: tokio::sync::Semaphore::new(0),
        });
        let mut factory = ConnectionFactory::empty();
        let shared = plc.clone();
        factory.register("simulated", move |_, _| Ok(shared.clone() as Arc<dyn Connection>));
        let handler = Handler::with_factory(store.clone(), factory);
        handler
            .configure(&GatewayConfig::from_toml_str(EXAMPLE_CONFIG).unwrap())
            .await
            .unwrap();
        handler.start().await.unwrap();

        // the second update of Conveyor/On queues behind the first
        handler.send("Conveyor", "On", None).await.unwrap();
        handler
            .send("Conveyor", "On", Some(Value::Bool(false)))
            .await
            .unwrap();
        plc.inject("DI.3", false);

        let door = LogicalKey::new("Door", "Closed");
        let persisted = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while store.inner.value_of(&door).is_none() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(persisted.is_ok());
        assert!(store.inner.value_of(&LogicalKey::new("Conveyor", "On")).is_none());

        store.gate.add_permits(1);
        handler.flush().await;
        let stored = store.inner.value_of(&LogicalKey::new("Conveyor", "On")).unwrap();
        assert_eq!(stored.value, Value::Bool(false));
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_states_are_recorded() {
        let plc = example_plc();
        let store = Arc::new(MemoryStore::new());
        let handler = handler_with(plc.clone(), store.clone());
        handler
            .configure(&GatewayConfig::from_toml_str(EXAMPLE_CONFIG).unwrap())
            .await
            .unwrap();
        handler.start().await.unwrap();
        plc.drop_link("cable pulled");
        handler.flush().await;

        let conn = store.read_state("connection", "plc1").await.unwrap().unwrap();
        assert_eq!(conn.state, "Failed");
        assert_eq!(conn.message.as_deref(), Some("cable pulled"));

        let main = store.read_state("handler", "main").await.unwrap().unwrap();
        assert_eq!(main.state, "Started");

        assert_eq!(handler.remote_addresses().len(), 2);
    }

    #[tokio::test]
    async fn test_send_requires_started() {
        let handler = Handler::new(Arc::new(MemoryStore::new()));
        handler
            .configure(&GatewayConfig::from_toml_str(EXAMPLE_CONFIG).unwrap())
            .await
            .unwrap();
        assert!(matches!(
            handler.send("Conveyor", "On", None).await,
            Err(GatewayError::InvalidState(_))
        ));
    }
}
