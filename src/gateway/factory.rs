//! Connection factory.
//!
//! Creates connections from configuration by `kind` and assembles the
//! [`Runtime`] from a [`GatewayConfig`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::address::{Interner, LogicalAddress};
use crate::core::error::{GatewayError, Result};
use crate::core::logging::LogContext;
use crate::core::traits::Connection;
use crate::protocols::simulated::{self, SimulatedConnection, SimulatedParamsConfig};

use super::address::{is_virtual_address, validate_virtual_address};
use super::config::{AddressDef, ConnectionConfig, GatewayConfig};
use super::listeners::ListenerRegistry;
use super::runtime::{Runtime, RuntimeBuilder};

/// Builds one connection from its configuration and owned raw addresses.
pub type ConnectionBuilderFn =
    dyn Fn(&ConnectionConfig, HashSet<String>) -> Result<Arc<dyn Connection>> + Send + Sync;

/// Registry of connection kinds.
///
/// Pre-populated with `simulated`; applications register their drivers.
pub struct ConnectionFactory {
    builders: HashMap<String, Arc<ConnectionBuilderFn>>,
}

impl Default for ConnectionFactory {
    fn default() -> Self {
        let mut factory = Self::empty();
        factory.register(simulated::KIND, create_simulated_connection);
        factory
    }
}

impl ConnectionFactory {
    /// Factory with the built-in drivers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory without any driver.
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Register (or replace) a driver. Kinds are case-insensitive.
    pub fn register<F>(&mut self, kind: &str, builder: F)
    where
        F: Fn(&ConnectionConfig, HashSet<String>) -> Result<Arc<dyn Connection>>
            + Send
            + Sync
            + 'static,
    {
        self.builders
            .insert(kind.to_ascii_lowercase(), Arc::new(builder));
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.builders.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Create a connection.
    pub fn create(
        &self,
        config: &ConnectionConfig,
        addresses: HashSet<String>,
    ) -> Result<Arc<dyn Connection>> {
        let builder = self
            .builders
            .get(&config.kind.to_ascii_lowercase())
            .ok_or_else(|| {
                GatewayError::Config(format!(
                    "unknown connection kind {} for {}. Known kinds: {}",
                    config.kind,
                    config.id,
                    self.kinds().join(", ")
                ))
            })?;
        builder(config, addresses)
    }
}

fn create_simulated_connection(
    config: &ConnectionConfig,
    addresses: HashSet<String>,
) -> Result<Arc<dyn Connection>> {
    let params: SimulatedParamsConfig = config.params()?;
    let sim_config = params.to_config(&config.id, addresses, config.auto_connect);
    Ok(Arc::new(SimulatedConnection::new(sim_config)))
}

/// Convert an address definition into a logical address.
///
/// Virtual raw addresses are detected by family prefix and validated.
pub fn build_address(def: &AddressDef, interner: &mut Interner) -> Result<LogicalAddress> {
    let key = interner.key(&def.resource, &def.action);
    let is_virtual = is_virtual_address(&def.raw_address);
    if is_virtual {
        validate_virtual_address(&def.raw_address, def.value_type)?;
    }

    let mut address = LogicalAddress::new(key, def.kind, def.raw_address.clone(), def.value_type)
        .with_inverted(def.inverted)
        .with_remote(def.remote)
        .with_virtual(is_virtual);

    if let Some(default) = &def.default_value {
        let value = def.value_type.coerce(default.clone()).map_err(|e| {
            GatewayError::Config(format!(
                "bad default value for {}/{}: {}",
                def.resource, def.action, e
            ))
        })?;
        address = address.with_default(value);
    }
    Ok(address)
}

/// Build a runtime from configuration.
///
/// Each connection owns the raw addresses of the physical addresses that
/// name it.
pub fn build_runtime(
    config: &GatewayConfig,
    factory: &ConnectionFactory,
    listeners: Arc<ListenerRegistry>,
    log: LogContext,
) -> Result<Runtime> {
    config.validate()?;

    let mut owned: HashMap<&str, HashSet<String>> = HashMap::new();
    for def in &config.addresses {
        if let Some(conn) = &def.connection {
            owned
                .entry(conn.as_str())
                .or_default()
                .insert(def.raw_address.clone());
        }
    }

    let mut builder = RuntimeBuilder::new(listeners)
        .log(log)
        .queue_warn_threshold(config.runtime.queue_warn_threshold);

    for conn_config in &config.connections {
        let addresses = owned.remove(conn_config.id.as_str()).unwrap_or_default();
        let connection = factory.create(conn_config, addresses)?;
        tracing::debug!(
            connection = %conn_config.id,
            kind = %conn_config.kind,
            "Connection created"
        );
        builder = builder.connection(connection);
    }

    let mut interner = Interner::new();
    for def in &config.addresses {
        let address = build_address(def, &mut interner)?;
        builder = builder.address(address, def.connection.as_deref());
    }

    builder.build()
}
