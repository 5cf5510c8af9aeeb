//! Gateway wire messages.
//!
//! JSON objects discriminated by `messageType`. Field names are camelCase.
//!
//! ```json
//! {"messageType":"PlcTelegram","sequenceId":1718000000001,"plcId":"plc-0001",
//!  "resource":"Conveyor","action":"On","value":true}
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::address::LogicalKey;
use crate::core::data::Value;
use crate::core::error::{GatewayError, Result};
use crate::core::traits::ConnectionState;

/// Every message exchanged over a gateway session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType")]
pub enum GatewayMessage {
    Authentication(AuthenticationRequest),
    AuthenticationResponse(AuthenticationResponse),
    PlcNotification(PlcNotification),
    PlcTelegram(PlcTelegram),
    PlcTelegramResponse(PlcTelegramResponse),
    PlcStateQuery(PlcStateQuery),
    StateNotification(StateNotification),
    Message(LogMessage),
    DisableMessage(DisableMessage),
}

impl GatewayMessage {
    /// Encode as a JSON string.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON. Malformed input is a protocol error.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| GatewayError::Protocol(format!("malformed message: {}", e)))
    }

    /// The `messageType` discriminator.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "Authentication",
            Self::AuthenticationResponse(_) => "AuthenticationResponse",
            Self::PlcNotification(_) => "PlcNotification",
            Self::PlcTelegram(_) => "PlcTelegram",
            Self::PlcTelegramResponse(_) => "PlcTelegramResponse",
            Self::PlcStateQuery(_) => "PlcStateQuery",
            Self::StateNotification(_) => "StateNotification",
            Self::Message(_) => "Message",
            Self::DisableMessage(_) => "DisableMessage",
        }
    }
}

/// Connection entry of a system snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub id: String,
    pub state: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// System state reported with authentication and periodic snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemState {
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    #[serde(default)]
    pub connections: Vec<ConnectionSnapshot>,
}

/// Client → server, first message on a new transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationRequest {
    pub plc_id: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub versions: BTreeMap<String, String>,
    pub system_state: SystemState,
}

/// Outcome indicator of an authentication response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthState {
    Success,
    Failure,
}

/// Server → client.
///
/// Fields are optional on the wire; a response without a success state
/// and a token is an authentication failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationResponse {
    #[serde(default)]
    pub state: Option<AuthState>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl AuthenticationResponse {
    pub fn success(token: impl Into<String>) -> Self {
        Self {
            state: Some(AuthState::Success),
            message: None,
            auth_token: Some(token.into()),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            state: Some(AuthState::Failure),
            message: Some(message.into()),
            auth_token: None,
        }
    }

    /// The token, if the response is a complete success.
    pub fn accepted_token(&self) -> Result<&str> {
        match (&self.state, self.auth_token.as_deref()) {
            (Some(AuthState::Success), Some(token)) if !token.is_empty() => Ok(token),
            (Some(AuthState::Success), _) => {
                Err(GatewayError::Auth("response carries no token".into()))
            }
            (Some(AuthState::Failure), _) => Err(GatewayError::Auth(
                self.message
                    .clone()
                    .unwrap_or_else(|| "rejected".to_string()),
            )),
            (None, _) => Err(GatewayError::Auth("response carries no state".into())),
        }
    }
}

/// A value change forwarded to the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlcNotification {
    pub plc_id: String,
    pub resource: String,
    pub action: String,
    pub value: Value,
}

impl PlcNotification {
    pub fn key(&self) -> LogicalKey {
        LogicalKey::new(&self.resource, &self.action)
    }
}

/// Server → client command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlcTelegram {
    pub sequence_id: u64,
    pub plc_id: String,
    pub resource: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Server → client read of the last known value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlcStateQuery {
    pub sequence_id: u64,
    pub plc_id: String,
    pub resource: String,
    pub action: String,
}

/// Result of a telegram or state query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TelegramState {
    Done,
    Failed,
}

/// Client → server answer, correlated by `sequenceId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlcTelegramResponse {
    pub sequence_id: u64,
    pub state: TelegramState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl PlcTelegramResponse {
    pub fn done(sequence_id: u64, value: Option<Value>) -> Self {
        Self {
            sequence_id,
            state: TelegramState::Done,
            message: None,
            value,
        }
    }

    pub fn failed(sequence_id: u64, message: impl Into<String>) -> Self {
        Self {
            sequence_id,
            state: TelegramState::Failed,
            message: Some(message.into()),
            value: None,
        }
    }
}

/// Periodic snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateNotification {
    pub plc_id: String,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub versions: BTreeMap<String, String>,
    pub system_state: SystemState,
}

/// Operator log line forwarding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    #[serde(default)]
    pub plc_id: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    pub text: String,
}

/// Operator log forwarding switch-off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisableMessage {
    #[serde(default)]
    pub plc_id: Option<String>,
}
