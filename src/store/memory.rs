//! In-memory value store implementation using DashMap.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::core::address::LogicalKey;
use crate::core::data::ValueChange;
use crate::core::error::{GatewayError, Result};

use super::traits::{StateRecord, StorageId, StoredValue, ValueStore};

/// In-memory value store.
///
/// The default backend for standalone and simulated use.
///
/// # Example
///
/// ```rust,ignore
/// use plcgw::store::MemoryStore;
///
/// let store = MemoryStore::new();
/// let mut changes = store.subscribe(64);
/// ```
pub struct MemoryStore {
    next_id: AtomicU64,

    /// Logical key -> storage id
    ids: DashMap<LogicalKey, StorageId>,

    /// Storage id -> last value
    values: DashMap<StorageId, StoredValue>,

    /// "component:name" -> state record
    states: DashMap<String, StateRecord>,

    /// Change subscribers
    subscribers: RwLock<Vec<mpsc::Sender<ValueChange>>>,

    /// Reject updates (simulates a broken backend)
    fail_updates: AtomicBool,
}

impl MemoryStore {
    /// Create a new memory store.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ids: DashMap::new(),
            values: DashMap::new(),
            states: DashMap::new(),
            subscribers: RwLock::new(Vec::new()),
            fail_updates: AtomicBool::new(false),
        }
    }

    fn state_key(component: &str, name: &str) -> String {
        format!("{}:{}", component, name)
    }

    /// Receive every committed change. Slow subscribers miss changes.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<ValueChange> {
        let (tx, rx) = mpsc::channel(capacity);
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.push(tx);
        }
        rx
    }

    /// Make subsequent updates fail.
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Last value committed for `key`, if any.
    pub fn value_of(&self, key: &LogicalKey) -> Option<StoredValue> {
        let id = *self.ids.get(key)?;
        self.values.get(&id).map(|v| v.clone())
    }

    /// Number of addresses with a committed value.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing was committed yet.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn notify_subscribers(&self, change: &ValueChange) {
        if let Ok(subscribers) = self.subscribers.read() {
            for sender in subscribers.iter() {
                let _ = sender.try_send(change.clone());
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ValueStore for MemoryStore {
    async fn logical_address_id(&self, key: &LogicalKey) -> Result<StorageId> {
        let id = *self
            .ids
            .entry(key.clone())
            .or_insert_with(|| StorageId(self.next_id.fetch_add(1, Ordering::Relaxed)));
        Ok(id)
    }

    async fn update(&self, id: StorageId, change: &ValueChange) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(GatewayError::Store(format!(
                "update of {} rejected",
                change.key
            )));
        }

        {
            let mut entry = self.values.entry(id).or_insert_with(|| StoredValue {
                key: change.key.clone(),
                value: change.value.clone(),
                timestamp: change.timestamp,
                version: 0,
            });
            entry.value = change.value.clone();
            entry.timestamp = change.timestamp;
            entry.version += 1;
        }

        self.notify_subscribers(change);
        Ok(())
    }

    async fn read(&self, id: StorageId) -> Result<Option<StoredValue>> {
        Ok(self.values.get(&id).map(|v| v.clone()))
    }

    async fn record_state(&self, component: &str, name: &str, record: StateRecord) -> Result<()> {
        self.states.insert(Self::state_key(component, name), record);
        Ok(())
    }

    async fn read_state(&self, component: &str, name: &str) -> Result<Option<StateRecord>> {
        Ok(self
            .states
            .get(&Self::state_key(component, name))
            .map(|r| r.clone()))
    }
}
