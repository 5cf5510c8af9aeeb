//! Connection driver metadata.
//!
//! Drivers describe themselves (name, parameters, example configuration)
//! so the CLI can list what a configuration may reference by `kind`.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameter type for configuration options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Integer,
    Boolean,
    Float,
    Object,
    Array,
}

/// Metadata for a single configuration parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterMetadata {
    /// Internal parameter name (used in config).
    pub name: &'static str,
    /// Description of the parameter.
    pub description: &'static str,
    /// Whether this parameter is required.
    pub required: bool,
    /// Default value if not specified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    /// Type of the parameter.
    pub param_type: ParameterType,
}

impl ParameterMetadata {
    /// Create a new required parameter.
    pub const fn required(
        name: &'static str,
        description: &'static str,
        param_type: ParameterType,
    ) -> Self {
        Self {
            name,
            description,
            required: true,
            default_value: None,
            param_type,
        }
    }

    /// Create a new optional parameter with a default value.
    pub fn optional(
        name: &'static str,
        description: &'static str,
        param_type: ParameterType,
        default_value: Value,
    ) -> Self {
        Self {
            name,
            description,
            required: false,
            default_value: Some(default_value),
            param_type,
        }
    }
}

/// Metadata for a connection driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverMetadata {
    /// Driver name, referenced by `kind` in configuration.
    pub name: &'static str,
    /// Human-readable display name.
    pub display_name: &'static str,
    /// Description of the driver.
    pub description: &'static str,
    /// Example `parameters` table.
    pub example_config: Value,
    /// Available configuration parameters.
    pub parameters: Vec<ParameterMetadata>,
}

/// Implemented by drivers that publish metadata.
pub trait HasMetadata {
    /// Driver metadata.
    fn metadata() -> DriverMetadata;
}

/// Registry of built-in drivers.
#[derive(Debug, Default)]
pub struct DriverRegistry {
    drivers: Vec<DriverMetadata>,
}

impl DriverRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver.
    pub fn register(&mut self, driver: DriverMetadata) {
        self.drivers.push(driver);
    }

    /// All registered drivers.
    pub fn drivers(&self) -> &[DriverMetadata] {
        &self.drivers
    }

    /// Look up a driver by name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&DriverMetadata> {
        self.drivers
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
    }
}

fn build_registry() -> DriverRegistry {
    use crate::protocols::simulated::SimulatedConnection;

    let mut registry = DriverRegistry::new();
    registry.register(SimulatedConnection::metadata());
    registry
}

static DRIVER_REGISTRY: Lazy<DriverRegistry> = Lazy::new(build_registry);

/// Get the global driver metadata registry.
pub fn get_driver_registry() -> &'static DriverRegistry {
    &DRIVER_REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_simulated() {
        let registry = get_driver_registry();
        let simulated = registry.get("Simulated").expect("simulated driver");
        assert_eq!(simulated.name, "simulated");
        assert!(simulated
            .parameters
            .iter()
            .any(|p| p.name == "echo_writes" && !p.required));
    }
}
