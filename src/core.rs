//! Core abstractions for the gateway control plane.
//!
//! This module provides the value and address model plus the traits that
//! connections and listeners implement.

pub mod address;
pub mod data;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod traits;

pub use address::*;
pub use data::*;
pub use error::{GatewayError, Result};
pub use traits::*;
