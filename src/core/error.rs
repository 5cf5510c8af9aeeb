//! Error types for the gateway control plane.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Unified error type.
///
/// Variants follow the failure taxonomy of the runtime: configuration errors
/// abort startup, I/O failures are transient and scoped to one call, protocol
/// failures tear down a remote session.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A logical address was resolved that is not configured.
    #[error("unknown address {resource}/{action}")]
    UnknownAddress {
        /// Resource part of the logical address.
        resource: String,
        /// Action part of the logical address.
        action: String,
    },

    /// The target is not connected and will not be connected implicitly.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// A connection attempt failed.
    #[error("connection {connection} failed: {reason}")]
    ConnectionFailed {
        /// Connection identifier.
        connection: String,
        /// Human-readable reason.
        reason: String,
    },

    /// Transport or device I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Malformed or unexpected protocol traffic.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication rejected or incomplete.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// An operation did not complete in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Operation not allowed in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Value missing or not convertible to the declared type.
    #[error("value error: {0}")]
    Value(String),

    /// A directly invoked listener (virtual address binding) failed.
    #[error("listener failed: {0}")]
    Listener(String),

    /// Persistence backend failure.
    #[error("store error: {0}")]
    Store(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML configuration parse failure.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl GatewayError {
    /// Build an [`GatewayError::UnknownAddress`].
    pub fn unknown_address(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self::UnknownAddress {
            resource: resource.into(),
            action: action.into(),
        }
    }

    /// Build a [`GatewayError::ConnectionFailed`].
    pub fn connection_failed(connection: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            connection: connection.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error aborts configuration or startup.
    pub fn is_fatal_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Toml(_))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::unknown_address("Conveyor", "On");
        assert_eq!(err.to_string(), "unknown address Conveyor/On");

        let err = GatewayError::connection_failed("plc1", "refused");
        assert_eq!(err.to_string(), "connection plc1 failed: refused");
    }

    #[test]
    fn test_is_fatal_config() {
        assert!(GatewayError::Config("dup".into()).is_fatal_config());
        assert!(!GatewayError::Io("reset".into()).is_fatal_config());
    }
}
