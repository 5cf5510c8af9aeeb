//! Logical address model.
//!
//! A logical address names a signal by `(resource, action)` independent of
//! hardware wiring. Each address carries the raw address the owning
//! connection understands, the declared value type and the inversion and
//! virtual flags that the runtime applies transparently.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::data::{Value, ValueType};
use crate::core::error::{GatewayError, Result};

/// Identity of a logical address: an interned `(resource, action)` pair.
///
/// Cloning is two reference-count increments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalKey {
    resource: Arc<str>,
    action: Arc<str>,
}

impl LogicalKey {
    /// Create a key without interning.
    pub fn new(resource: impl AsRef<str>, action: impl AsRef<str>) -> Self {
        Self {
            resource: Arc::from(resource.as_ref()),
            action: Arc::from(action.as_ref()),
        }
    }

    /// Resource part.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Action part.
    pub fn action(&self) -> &str {
        &self.action
    }
}

impl std::fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.resource, self.action)
    }
}

/// String interner used while building a configuration.
///
/// Resource names repeat across many addresses ("Conveyor/On",
/// "Conveyor/Off", ...); interning makes every key share one allocation
/// per distinct string.
#[derive(Debug, Default)]
pub struct Interner {
    strings: HashSet<Arc<str>>,
}

impl Interner {
    /// Create an empty interner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shared copy of `s`.
    pub fn intern(&mut self, s: &str) -> Arc<str> {
        if let Some(existing) = self.strings.get(s) {
            return Arc::clone(existing);
        }
        let shared: Arc<str> = Arc::from(s);
        self.strings.insert(Arc::clone(&shared));
        shared
    }

    /// Build an interned key.
    pub fn key(&mut self, resource: &str, action: &str) -> LogicalKey {
        LogicalKey {
            resource: self.intern(resource),
            action: self.intern(action),
        }
    }

    /// Number of distinct strings held.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Whether the interner is empty.
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

/// Direction of a logical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    /// Event address (hardware → runtime).
    Notification,
    /// Command address (runtime → hardware).
    Telegram,
}

impl std::fmt::Display for AddressKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Notification => write!(f, "notification"),
            Self::Telegram => write!(f, "telegram"),
        }
    }
}

/// A configured logical address.
///
/// Equality and hashing use the key only, so a notification and a telegram
/// may share one raw address while remaining distinct logical objects.
#[derive(Debug, Clone)]
pub struct LogicalAddress {
    /// `(resource, action)` identity.
    pub key: LogicalKey,

    /// Notification or telegram.
    pub kind: AddressKind,

    /// Hardware-facing address string.
    pub raw_address: String,

    /// Declared value type.
    pub value_type: ValueType,

    /// Value written when a telegram is sent without an explicit value.
    pub default_value: Option<Value>,

    /// Flip boolean values on both read and write paths.
    pub inverted: bool,

    /// Forward this address to the remote gateway.
    pub remote: bool,

    /// Bypass physical connections; backed by a direct listener.
    pub is_virtual: bool,
}

impl LogicalAddress {
    /// Create an address with no default, not inverted, local, physical.
    pub fn new(
        key: LogicalKey,
        kind: AddressKind,
        raw_address: impl Into<String>,
        value_type: ValueType,
    ) -> Self {
        Self {
            key,
            kind,
            raw_address: raw_address.into(),
            value_type,
            default_value: None,
            inverted: false,
            remote: false,
            is_virtual: false,
        }
    }

    /// Set the default value.
    #[must_use]
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    /// Set inversion.
    #[must_use]
    pub fn with_inverted(mut self, inverted: bool) -> Self {
        self.inverted = inverted;
        self
    }

    /// Set remote forwarding.
    #[must_use]
    pub fn with_remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }

    /// Mark as virtual.
    #[must_use]
    pub fn with_virtual(mut self, is_virtual: bool) -> Self {
        self.is_virtual = is_virtual;
        self
    }

    /// Resource part of the key.
    pub fn resource(&self) -> &str {
        self.key.resource()
    }

    /// Action part of the key.
    pub fn action(&self) -> &str {
        self.key.action()
    }

    /// Whether inversion applies to this address.
    #[inline]
    pub fn inverts(&self) -> bool {
        self.inverted && self.value_type == ValueType::Boolean
    }

    /// Apply inversion.
    ///
    /// Flips boolean values when the address is an inverted boolean; any
    /// other value passes through. The same function is used for
    /// hardware → listener and command → hardware, and it is its own inverse.
    pub fn apply_inversion(&self, value: Value) -> Value {
        match value {
            Value::Bool(b) if self.inverts() => Value::Bool(!b),
            other => other,
        }
    }

    /// Resolve the value to send: the explicit value, else the default,
    /// normalized to the declared type.
    pub fn value_or_default(&self, value: Option<Value>) -> Result<Value> {
        let value = value.or_else(|| self.default_value.clone()).ok_or_else(|| {
            GatewayError::Value(format!("no value given and no default for {}", self.key))
        })?;
        self.value_type.coerce(value)
    }
}

impl PartialEq for LogicalAddress {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for LogicalAddress {}

impl Hash for LogicalAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

/// Lookup table from logical key to address.
///
/// Built once per configuration and read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct AddressTable {
    addresses: HashMap<LogicalKey, Arc<LogicalAddress>>,
}

impl AddressTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an address. Duplicate keys are a configuration error.
    pub fn insert(&mut self, address: LogicalAddress) -> Result<Arc<LogicalAddress>> {
        if self.addresses.contains_key(&address.key) {
            return Err(GatewayError::Config(format!(
                "duplicate logical address {}",
                address.key
            )));
        }
        let address = Arc::new(address);
        self.addresses
            .insert(address.key.clone(), Arc::clone(&address));
        Ok(address)
    }

    /// Resolve by resource and action.
    pub fn resolve(&self, resource: &str, action: &str) -> Result<Arc<LogicalAddress>> {
        self.get(&LogicalKey::new(resource, action))
            .ok_or_else(|| GatewayError::unknown_address(resource, action))
    }

    /// Look up by key.
    pub fn get(&self, key: &LogicalKey) -> Option<Arc<LogicalAddress>> {
        self.addresses.get(key).cloned()
    }

    /// Iterate over all addresses.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<LogicalAddress>> {
        self.addresses.values()
    }

    /// Number of addresses.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}
