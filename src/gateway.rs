//! Gateway control plane: configuration, dispatch runtime and handler.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                  Handler                    │
//! │  lifecycle · value cache · persistence      │
//! ├─────────────────────────────────────────────┤
//! │                  Runtime                    │
//! │  routing table · notification mapping       │
//! │  ordered event queue · virtual bindings     │
//! ├───────────────────────┬─────────────────────┤
//! │   ListenerRegistry    │    Connections      │
//! └───────────────────────┴─────────────────────┘
//! ```
//!
//! Values written by a telegram and values reported by hardware both end in
//! [`ListenerRegistry::deliver`], always post-inversion.

pub mod address;
pub mod config;
pub mod factory;
pub mod handler;
pub mod listeners;
pub mod runtime;

pub use address::{is_virtual_address, parse_virtual_address, validate_virtual_address, VirtualFamily};
pub use config::{
    AddressDef, ClientSettings, ConnectionConfig, CredentialDef, GatewayConfig, RuntimeSettings,
    ServerSettings,
};
pub use factory::{build_address, build_runtime, ConnectionFactory};
pub use handler::{Handler, HandlerState};
pub use listeners::ListenerRegistry;
pub use runtime::{NotificationMapping, Runtime, RuntimeBuilder, ValueObserver};
