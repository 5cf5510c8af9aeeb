//! ValueStore trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::address::LogicalKey;
use crate::core::data::{Value, ValueChange};
use crate::core::error::Result;

/// Identifier of a logical address inside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageId(pub u64);

/// Last persisted value of an address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredValue {
    pub key: LogicalKey,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    /// Number of updates committed for this address.
    pub version: u64,
}

/// Persisted state/message pair of a component (connection, handler,
/// gateway client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub state: String,
    pub message: Option<String>,
}

/// Persistence backend for address values and component states.
///
/// The Handler calls it off the delivery path. Updates for one address are
/// serialized by the caller; implementations commit each update on its own.
#[async_trait]
pub trait ValueStore: Send + Sync {
    /// Resolve (or allocate) the storage id of a logical address.
    async fn logical_address_id(&self, key: &LogicalKey) -> Result<StorageId>;

    /// Commit a new value.
    async fn update(&self, id: StorageId, change: &ValueChange) -> Result<()>;

    /// Read the last committed value.
    async fn read(&self, id: StorageId) -> Result<Option<StoredValue>>;

    /// Record the state of a component, e.g. `("connection", "plc1")`.
    async fn record_state(&self, component: &str, name: &str, record: StateRecord) -> Result<()>;

    /// Read a recorded component state.
    async fn read_state(&self, component: &str, name: &str) -> Result<Option<StateRecord>>;
}
