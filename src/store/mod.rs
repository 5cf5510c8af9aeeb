//! Persistence boundary.
//!
//! The Handler persists every delivered value and every component state
//! transition through the [`ValueStore`] trait:
//!
//! - `MemoryStore`: in-memory storage using DashMap (default)
//!
//! A transactional database backend implements the same trait outside
//! this crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use plcgw::store::{MemoryStore, ValueStore};
//!
//! let store = Arc::new(MemoryStore::new());
//! let handler = Handler::new(store.clone());
//! ```

mod memory;
mod traits;

pub use memory::MemoryStore;
pub use traits::{StateRecord, StorageId, StoredValue, ValueStore};
