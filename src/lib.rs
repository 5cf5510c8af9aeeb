//! # PLC Gateway (plcgw)
//!
//! Control plane of an industrial I/O gateway: maps logical addresses
//! (`resource`/`action`) onto raw addresses of PLC connections, dispatches
//! writes and hardware notifications to listeners in order, and keeps an
//! authenticated session to a central server.
//!
//! ## Features
//!
//! - **Logical addressing**: telegrams (writes) and notifications (reads)
//!   with defaults, inversion and remote forwarding
//! - **Ordered dispatch**: one global queue for hardware events, failing
//!   listeners isolated
//! - **Virtual addresses**: `vbool.*`, `vint.*`, `vstring.*` backed by
//!   application code instead of hardware
//! - **Gateway sessions**: JSON messages over a framed transport, with
//!   heartbeat, buffering and last-writer-wins eviction
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use plcgw::prelude::*;
//!
//! let handler = Handler::new(Arc::new(MemoryStore::new()));
//! handler.configure(&GatewayConfig::from_file("gateway.toml")?).await?;
//! handler.start().await?;
//!
//! handler.send("Conveyor", "On", None).await?;
//! ```

pub mod core;
pub mod gateway;
pub mod protocols;
pub mod session;
pub mod store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::core::{
        address::*,
        data::*,
        error::{GatewayError, Result},
        logging::{LogContext, StateLogHandler, TracingLogHandler},
        traits::*,
    };
    pub use crate::gateway::{GatewayConfig, Handler, HandlerState};
    pub use crate::session::{GatewayClient, GatewayServer, RemoteListener};
    pub use crate::store::{MemoryStore, ValueStore};
}

// Re-export core types at crate root for convenience
pub use crate::core::address::{AddressKind, LogicalAddress, LogicalKey};
pub use crate::core::data::{Value, ValueType};
pub use crate::core::error::{GatewayError, Result};
pub use crate::core::traits::{AddressListener, Connection, ConnectionState, ConnectionStatus};
pub use crate::gateway::{GatewayConfig, Handler, HandlerState};
pub use crate::store::{MemoryStore, ValueStore};
