//! Connection implementations.
//!
//! Concrete hardware drivers live outside this crate and implement
//! [`Connection`](crate::core::traits::Connection) directly, usually by
//! embedding [`base::ConnectionBase`]. The simulated connection is the one
//! built-in driver.

pub mod base;
pub mod simulated;

pub use base::ConnectionBase;
pub use simulated::{SimulatedConfig, SimulatedConnection, SimulatedParamsConfig};
