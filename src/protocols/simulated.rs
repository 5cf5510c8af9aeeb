//! Simulated connection.
//!
//! An in-memory device that does not talk to any hardware. It backs
//! simulated mode (running a configuration without the plant attached) and
//! the test suite.
//!
//! # Example
//!
//! ```rust,ignore
//! use plcgw::protocols::simulated::{SimulatedConfig, SimulatedConnection};
//!
//! let plc = SimulatedConnection::new(SimulatedConfig::new("plc1").with_addresses(["DO.1", "DI.1"]));
//! plc.connect().await?;
//! plc.send("DO.1", &Value::Bool(true)).await?;
//! plc.inject("DI.1", Value::Bool(true)); // hardware event, queued
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::core::data::Value;
use crate::core::error::{GatewayError, Result};
use crate::core::metadata::{DriverMetadata, HasMetadata, ParameterMetadata, ParameterType};
use crate::core::traits::{Connection, ConnectionStatus, Diagnostics, EventSink};

use super::base::ConnectionBase;

/// Driver name used in configuration.
pub const KIND: &str = "simulated";

/// Simulated connection configuration.
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// Connection identifier.
    pub id: String,

    /// Owned raw addresses.
    pub addresses: HashSet<String>,

    /// Connect on runtime start and lazily on send.
    pub auto_connect: bool,

    /// Make `connect` fail.
    pub fail_connect: bool,

    /// Make `send` fail (and the connection transition to Failed).
    pub fail_writes: bool,

    /// Echo every write back as a queued hardware event on the same raw address.
    pub echo_writes: bool,

    /// Artificial latency for connect and send.
    pub latency: Duration,
}

impl SimulatedConfig {
    /// Create a configuration with defaults.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addresses: HashSet::new(),
            auto_connect: true,
            fail_connect: false,
            fail_writes: false,
            echo_writes: false,
            latency: Duration::ZERO,
        }
    }

    /// Set owned raw addresses.
    pub fn with_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// Set auto-connect.
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Enable write echo.
    pub fn with_echo_writes(mut self, echo: bool) -> Self {
        self.echo_writes = echo;
        self
    }

    /// Make connect attempts fail.
    pub fn with_fail_connect(mut self, fail: bool) -> Self {
        self.fail_connect = fail;
        self
    }
}

/// Simulated connection parameters (deserialized from the `parameters` table).
///
/// # Example TOML
/// ```toml
/// [connections.parameters]
/// echo_writes = true
/// latency_ms = 5
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SimulatedParamsConfig {
    /// Make `connect` fail.
    #[serde(default)]
    pub fail_connect: bool,

    /// Make `send` fail.
    #[serde(default)]
    pub fail_writes: bool,

    /// Echo writes back as hardware events.
    #[serde(default)]
    pub echo_writes: bool,

    /// Artificial latency in milliseconds.
    #[serde(default)]
    pub latency_ms: u64,

    /// Raw addresses owned in addition to the configured ones.
    #[serde(default)]
    pub extra_addresses: Vec<String>,
}

impl SimulatedParamsConfig {
    /// Convert to a [`SimulatedConfig`].
    pub fn to_config(
        &self,
        id: &str,
        mut addresses: HashSet<String>,
        auto_connect: bool,
    ) -> SimulatedConfig {
        addresses.extend(self.extra_addresses.iter().cloned());
        SimulatedConfig {
            id: id.to_string(),
            addresses,
            auto_connect,
            fail_connect: self.fail_connect,
            fail_writes: self.fail_writes,
            echo_writes: self.echo_writes,
            latency: Duration::from_millis(self.latency_ms),
        }
    }
}

/// In-memory device.
pub struct SimulatedConnection {
    base: ConnectionBase,
    echo_writes: bool,
    latency: Duration,
    fail_connect: AtomicBool,
    fail_writes: AtomicBool,
    connect_attempts: AtomicU64,
    /// Last value written per raw address.
    outputs: DashMap<String, Value>,
    /// Every write in order.
    write_log: Mutex<Vec<(String, Value)>>,
}

impl SimulatedConnection {
    /// Create a simulated connection.
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            base: ConnectionBase::new(config.id, KIND, config.addresses, config.auto_connect),
            echo_writes: config.echo_writes,
            latency: config.latency,
            fail_connect: AtomicBool::new(config.fail_connect),
            fail_writes: AtomicBool::new(config.fail_writes),
            connect_attempts: AtomicU64::new(0),
            outputs: DashMap::new(),
            write_log: Mutex::new(Vec::new()),
        }
    }

    /// Simulate a hardware event (queued delivery).
    pub fn inject(&self, raw_address: &str, value: impl Into<Value>) {
        self.base.notify(raw_address, value.into());
    }

    /// Simulate a hardware event observed on the driver's own thread
    /// (synchronous delivery).
    pub fn inject_sync(&self, raw_address: &str, value: impl Into<Value>) {
        self.base.sync_notify(raw_address, value.into());
    }

    /// Last value written to `raw_address`.
    pub fn written(&self, raw_address: &str) -> Option<Value> {
        self.outputs.get(raw_address).map(|v| v.value().clone())
    }

    /// All writes in order.
    pub fn write_log(&self) -> Vec<(String, Value)> {
        self.write_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Number of connect attempts so far.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Simulate an unexpected link loss.
    pub fn drop_link(&self, reason: &str) {
        self.base.fail(reason);
    }

    /// Toggle connect failures.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Toggle write failures.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl HasMetadata for SimulatedConnection {
    fn metadata() -> DriverMetadata {
        DriverMetadata {
            name: KIND,
            display_name: "Simulated Device",
            description: "In-memory device for simulated mode and testing. Does not connect to physical hardware.",
            example_config: serde_json::json!({
                "echo_writes": true,
                "latency_ms": 0
            }),
            parameters: vec![
                ParameterMetadata::optional(
                    "echo_writes",
                    "Echo every write back as a hardware event on the same raw address",
                    ParameterType::Boolean,
                    serde_json::json!(false),
                ),
                ParameterMetadata::optional(
                    "latency_ms",
                    "Artificial latency for connect and send",
                    ParameterType::Integer,
                    serde_json::json!(0),
                ),
                ParameterMetadata::optional(
                    "fail_connect",
                    "Make every connect attempt fail",
                    ParameterType::Boolean,
                    serde_json::json!(false),
                ),
                ParameterMetadata::optional(
                    "fail_writes",
                    "Make every write fail",
                    ParameterType::Boolean,
                    serde_json::json!(false),
                ),
                ParameterMetadata::optional(
                    "extra_addresses",
                    "Raw addresses owned in addition to those referenced by addresses",
                    ParameterType::Array,
                    serde_json::json!([]),
                ),
            ],
        }
    }
}

#[async_trait]
impl Connection for SimulatedConnection {
    fn id(&self) -> &str {
        self.base.id()
    }

    fn kind(&self) -> &'static str {
        KIND
    }

    fn auto_connect(&self) -> bool {
        self.base.auto_connect()
    }

    fn addresses(&self) -> HashSet<String> {
        self.base.addresses()
    }

    fn status(&self) -> ConnectionStatus {
        self.base.status()
    }

    fn bind(&self, sink: Arc<dyn EventSink>) {
        self.base.bind(sink);
    }

    async fn connect(&self) -> Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if self.fail_connect.load(Ordering::SeqCst) {
            let reason = "simulated connect failure";
            self.base.fail(reason);
            return Err(GatewayError::connection_failed(self.base.id(), reason));
        }

        self.base.mark_connected();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.base.mark_disconnected();
        Ok(())
    }

    async fn send(&self, raw_address: &str, value: &Value) -> Result<()> {
        if !self.base.state().is_connected() {
            return Err(GatewayError::NotConnected(self.base.id().to_string()));
        }
        if !self.base.owns(raw_address) {
            return Err(GatewayError::Io(format!(
                "{} does not own raw address {}",
                self.base.id(),
                raw_address
            )));
        }

        self.simulate_latency().await;

        if self.fail_writes.load(Ordering::SeqCst) {
            let reason = format!("simulated write failure on {}", raw_address);
            self.base.fail(reason.clone());
            return Err(GatewayError::Io(reason));
        }

        self.outputs.insert(raw_address.to_string(), value.clone());
        if let Ok(mut log) = self.write_log.lock() {
            log.push((raw_address.to_string(), value.clone()));
        }
        self.base.record_write();

        if self.echo_writes {
            self.base.notify(raw_address, value.clone());
        }
        Ok(())
    }

    fn diagnostics(&self) -> Diagnostics {
        self.base.diagnostics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::ConnectionState;

    fn plc() -> SimulatedConnection {
        SimulatedConnection::new(SimulatedConfig::new("plc1").with_addresses(["DO.1", "DI.1"]))
    }

    #[tokio::test]
    async fn test_connect_disconnect() {
        let plc = plc();
        assert_eq!(plc.status().state, ConnectionState::Disconnected);

        plc.connect().await.unwrap();
        assert_eq!(plc.status().state, ConnectionState::Connected);

        plc.disconnect().await.unwrap();
        assert_eq!(plc.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_records_writes() {
        let plc = plc();
        plc.connect().await.unwrap();
        plc.send("DO.1", &Value::Bool(true)).await.unwrap();
        plc.send("DO.1", &Value::Bool(false)).await.unwrap();

        assert_eq!(plc.written("DO.1"), Some(Value::Bool(false)));
        assert_eq!(plc.write_log().len(), 2);
        assert_eq!(plc.diagnostics().write_count, 2);
    }

    #[tokio::test]
    async fn test_send_requires_connection_and_ownership() {
        let plc = plc();
        assert!(matches!(
            plc.send("DO.1", &Value::Bool(true)).await,
            Err(GatewayError::NotConnected(_))
        ));

        plc.connect().await.unwrap();
        assert!(matches!(
            plc.send("DO.9", &Value::Bool(true)).await,
            Err(GatewayError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_failures_transition_to_failed() {
        let plc = SimulatedConnection::new(
            SimulatedConfig::new("plc1")
                .with_addresses(["DO.1"])
                .with_fail_connect(true),
        );
        assert!(plc.connect().await.is_err());
        assert_eq!(plc.status().state, ConnectionState::Failed);
        assert_eq!(plc.connect_attempts(), 1);

        plc.set_fail_connect(false);
        plc.connect().await.unwrap();
        plc.set_fail_writes(true);
        assert!(plc.send("DO.1", &Value::Bool(true)).await.is_err());
        let status = plc.status();
        assert_eq!(status.state, ConnectionState::Failed);
        assert!(status.message.unwrap().contains("DO.1"));
    }

    #[test]
    fn test_params_config() {
        let params: SimulatedParamsConfig = serde_json::from_value(serde_json::json!({
            "echo_writes": true,
            "extra_addresses": ["DI.7"]
        }))
        .unwrap();
        let config = params.to_config("plc1", HashSet::from(["DO.1".to_string()]), false);
        assert!(config.echo_writes);
        assert!(!config.auto_connect);
        assert!(config.addresses.contains("DI.7"));
        assert!(config.addresses.contains("DO.1"));
    }
}
