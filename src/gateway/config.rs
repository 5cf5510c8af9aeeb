//! Gateway configuration.
//!
//! Plain serde structs loaded from TOML. Per-connection parameter tables are
//! kept as `serde_json::Value` and deserialized by the connection factory
//! into each driver's own `*ParamsConfig`.
//!
//! # Example TOML
//!
//! ```toml
//! [[connections]]
//! id = "plc1"
//! kind = "simulated"
//!
//! [[addresses]]
//! resource = "Conveyor"
//! action = "On"
//! kind = "telegram"
//! raw_address = "DO.1"
//! connection = "plc1"
//! value_type = "boolean"
//! default_value = true
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::address::AddressKind;
use crate::core::data::{Value, ValueType};
use crate::core::error::{GatewayError, Result};

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Dispatch engine settings.
    #[serde(default)]
    pub runtime: RuntimeSettings,

    /// Connections owned by the runtime.
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,

    /// Logical address definitions.
    #[serde(default)]
    pub addresses: Vec<AddressDef>,

    /// Gateway session client settings.
    #[serde(default)]
    pub session: Option<ClientSettings>,

    /// Gateway session server settings.
    #[serde(default)]
    pub server: Option<ServerSettings>,
}

impl GatewayConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Structural checks that do not need the runtime.
    ///
    /// Raw-address conflicts and virtual-address syntax are checked when the
    /// runtime is built.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for conn in &self.connections {
            if conn.id.trim().is_empty() {
                return Err(GatewayError::Config("connection id must not be empty".into()));
            }
            if !ids.insert(conn.id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate connection id {}",
                    conn.id
                )));
            }
        }

        for def in &self.addresses {
            if def.resource.is_empty() || def.action.is_empty() {
                return Err(GatewayError::Config(format!(
                    "address {}/{} needs both resource and action",
                    def.resource, def.action
                )));
            }
            if let Some(conn) = &def.connection {
                if !ids.contains(conn.as_str()) {
                    return Err(GatewayError::Config(format!(
                        "address {}/{} refers to unknown connection {}",
                        def.resource, def.action, conn
                    )));
                }
            }
        }

        if let Some(session) = &self.session {
            if session.plc_id.is_empty() {
                return Err(GatewayError::Config("session.plc_id must not be empty".into()));
            }
        }
        Ok(())
    }
}

/// Dispatch engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Queue depth above which a warning is logged.
    #[serde(default = "default_queue_warn_threshold")]
    pub queue_warn_threshold: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            queue_warn_threshold: default_queue_warn_threshold(),
        }
    }
}

fn default_queue_warn_threshold() -> usize {
    10_000
}

/// One connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Connection identifier, referenced by addresses.
    pub id: String,

    /// Driver name resolved by the connection factory.
    pub kind: String,

    /// Connect on start and lazily on send.
    #[serde(default = "default_true")]
    pub auto_connect: bool,

    /// Driver-specific parameters.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl ConnectionConfig {
    /// Create a connection config with empty parameters.
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            auto_connect: true,
            parameters: serde_json::Value::Null,
        }
    }

    /// Deserialize the parameter table into a driver's params type.
    ///
    /// A missing table is treated as empty.
    pub fn params<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let raw = match &self.parameters {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(raw).map_err(|e| {
            GatewayError::Config(format!(
                "invalid parameters for connection {} ({}): {}",
                self.id, self.kind, e
            ))
        })
    }
}

fn default_true() -> bool {
    true
}

/// One logical address definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressDef {
    /// Resource name.
    pub resource: String,

    /// Action name.
    pub action: String,

    /// Notification or telegram.
    pub kind: AddressKind,

    /// Hardware-facing address (or virtual address such as `vbool.running`).
    pub raw_address: String,

    /// Owning connection; omitted for virtual addresses.
    #[serde(default)]
    pub connection: Option<String>,

    /// Declared type.
    #[serde(default = "default_value_type")]
    pub value_type: ValueType,

    /// Default telegram value, coerced to `value_type`.
    #[serde(default)]
    pub default_value: Option<Value>,

    /// Flip boolean values.
    #[serde(default)]
    pub inverted: bool,

    /// Forward to the remote gateway.
    #[serde(default)]
    pub remote: bool,
}

fn default_value_type() -> ValueType {
    ValueType::Boolean
}

/// Gateway session client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Identity of this gateway.
    pub plc_id: String,

    /// WebSocket URL of the gateway server (`ws://host:port/ws`).
    #[serde(default)]
    pub server: Option<String>,

    /// Largest accepted WebSocket message, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Credentials.
    #[serde(default)]
    pub username: String,

    /// Credentials.
    #[serde(default)]
    pub password: String,

    /// Software version reported in authentication and snapshots.
    #[serde(default = "default_version")]
    pub version: String,

    /// Delay before the first connect attempt.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Delay between a teardown and the next attempt.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Liveness ping period.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// System snapshot period.
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,

    /// How long to wait for the authentication response.
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
}

impl ClientSettings {
    /// Settings with default periods.
    pub fn new(plc_id: impl Into<String>) -> Self {
        Self {
            plc_id: plc_id.into(),
            server: None,
            max_message_size: default_max_message_size(),
            username: String::new(),
            password: String::new(),
            version: default_version(),
            initial_delay_ms: default_initial_delay_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            snapshot_interval_ms: default_snapshot_interval_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
        }
    }

    /// Set credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_retry_delay_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_snapshot_interval_ms() -> u64 {
    3_600_000
}

fn default_auth_timeout_ms() -> u64 {
    10_000
}

/// Gateway session server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Listen address of the WebSocket endpoint.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Largest accepted WebSocket message, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// A session without liveness for this long is evicted.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Expiry sweep period.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Accepted gateway credentials.
    #[serde(default)]
    pub credentials: Vec<CredentialDef>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_message_size: default_max_message_size(),
            session_timeout_ms: default_session_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            credentials: Vec::new(),
        }
    }
}

impl ServerSettings {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn default_listen() -> String {
    "0.0.0.0:7070".to_string()
}

fn default_max_message_size() -> usize {
    1 << 20
}

fn default_session_timeout_ms() -> u64 {
    60_000
}

fn default_sweep_interval_ms() -> u64 {
    10_000
}

/// One accepted gateway identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialDef {
    pub plc_id: String,
    pub username: String,
    pub password: String,
}

/// Example configuration printed by `plcgw example`.
pub const EXAMPLE_CONFIG: &str = r#"[runtime]
queue_warn_threshold = 10000

[[connections]]
id = "plc1"
kind = "simulated"
auto_connect = true

[connections.parameters]
echo_writes = true

[[addresses]]
resource = "Conveyor"
action = "On"
kind = "telegram"
raw_address = "DO.1"
connection = "plc1"
value_type = "boolean"
default_value = true
remote = true

[[addresses]]
resource = "Conveyor"
action = "Running"
kind = "notification"
raw_address = "DO.1"
connection = "plc1"
value_type = "boolean"
remote = true

[[addresses]]
resource = "Door"
action = "Closed"
kind = "notification"
raw_address = "DI.3"
connection = "plc1"
value_type = "boolean"
inverted = true

[[addresses]]
resource = "PLC"
action = "Running"
kind = "telegram"
raw_address = "vbool.running"
value_type = "boolean"

[session]
plc_id = "plc-0001"
server = "ws://127.0.0.1:7070/ws"
username = "gateway"
password = "secret"
heartbeat_interval_ms = 30000
retry_delay_ms = 30000
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config = GatewayConfig::from_toml_str(EXAMPLE_CONFIG).unwrap();
        assert_eq!(config.connections.len(), 1);
        assert_eq!(config.addresses.len(), 4);
        assert_eq!(config.runtime.queue_warn_threshold, 10_000);

        let conveyor = &config.addresses[0];
        assert_eq!(conveyor.kind, AddressKind::Telegram);
        assert_eq!(conveyor.default_value, Some(Value::Bool(true)));

        let session = config.session.unwrap();
        assert_eq!(session.plc_id, "plc-0001");
        assert_eq!(session.server.as_deref(), Some("ws://127.0.0.1:7070/ws"));
        assert_eq!(session.max_message_size, 1 << 20);
        assert_eq!(session.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(session.snapshot_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_toml_str(
            r#"
            [[connections]]
            id = "plc1"
            kind = "simulated"
            "#,
        )
        .unwrap();
        assert!(config.connections[0].auto_connect);
        assert!(config.session.is_none());

        let params: crate::protocols::SimulatedParamsConfig =
            config.connections[0].params().unwrap();
        assert!(!params.echo_writes);
    }

    #[test]
    fn test_unknown_connection_rejected() {
        let err = GatewayConfig::from_toml_str(
            r#"
            [[addresses]]
            resource = "Conveyor"
            action = "On"
            kind = "telegram"
            raw_address = "DO.1"
            connection = "missing"
            "#,
        )
        .unwrap_err();
        assert!(err.is_fatal_config());
    }

    #[test]
    fn test_duplicate_connection_rejected() {
        let err = GatewayConfig::from_toml_str(
            r#"
            [[connections]]
            id = "plc1"
            kind = "simulated"

            [[connections]]
            id = "plc1"
            kind = "simulated"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_bad_params_are_config_errors() {
        let mut conn = ConnectionConfig::new("plc1", "simulated");
        conn.parameters = serde_json::json!({ "latency_ms": "slow" });
        let result: Result<crate::protocols::SimulatedParamsConfig> = conn.params();
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
