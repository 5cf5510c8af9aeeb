//! Outstanding server → client requests, correlated by sequence id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::core::address::LogicalKey;
use crate::core::data::Value;

/// Progress of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseState {
    /// Registered, not yet on the wire.
    Pending,
    /// Written to the transport.
    Sent,
    /// The client executed it.
    Done,
    /// The client rejected it, or the session went away.
    Failed,
}

impl ResponseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for ResponseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Sent => "Sent",
            Self::Done => "Done",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Terminal result delivered to the requester.
#[derive(Debug, Clone, PartialEq)]
pub struct TelegramOutcome {
    pub sequence_id: u64,
    pub state: ResponseState,
    pub message: Option<String>,
    pub value: Option<Value>,
}

impl TelegramOutcome {
    fn failed(sequence_id: u64, message: &str) -> Self {
        Self {
            sequence_id,
            state: ResponseState::Failed,
            message: Some(message.to_string()),
            value: None,
        }
    }
}

/// Handle on a request in flight.
#[derive(Debug)]
pub struct TelegramReceipt {
    pub sequence_id: u64,
    rx: oneshot::Receiver<TelegramOutcome>,
}

impl TelegramReceipt {
    /// Wait for the terminal outcome.
    pub async fn outcome(self) -> TelegramOutcome {
        let sequence_id = self.sequence_id;
        self.rx
            .await
            .unwrap_or_else(|_| TelegramOutcome::failed(sequence_id, DISCONNECTED))
    }

    /// Wait at most `timeout`; `None` if still outstanding.
    pub async fn outcome_within(self, timeout: Duration) -> Option<TelegramOutcome> {
        tokio::time::timeout(timeout, self.outcome()).await.ok()
    }
}

/// Failure message for requests whose session went away.
pub const DISCONNECTED: &str = "disconnected/timed out";

struct PendingResponse {
    plc_id: String,
    key: LogicalKey,
    state: ResponseState,
    callback: oneshot::Sender<TelegramOutcome>,
}

/// Requests awaiting a `PlcTelegramResponse`.
pub struct PendingResponses {
    next_sequence: AtomicU64,
    entries: DashMap<u64, PendingResponse>,
}

impl PendingResponses {
    /// Sequence ids start at the current wall-clock milliseconds, so they
    /// do not repeat across server restarts.
    pub fn new() -> Self {
        let seed = chrono::Utc::now().timestamp_millis().max(1) as u64;
        Self::starting_at(seed)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next_sequence: AtomicU64::new(first),
            entries: DashMap::new(),
        }
    }

    /// Register a request; returns its receipt.
    pub fn insert(&self, plc_id: &str, key: LogicalKey) -> TelegramReceipt {
        let sequence_id = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let (callback, rx) = oneshot::channel();
        self.entries.insert(
            sequence_id,
            PendingResponse {
                plc_id: plc_id.to_string(),
                key,
                state: ResponseState::Pending,
                callback,
            },
        );
        TelegramReceipt { sequence_id, rx }
    }

    pub fn mark_sent(&self, sequence_id: u64) {
        if let Some(mut entry) = self.entries.get_mut(&sequence_id) {
            entry.state = ResponseState::Sent;
        }
    }

    /// State of an outstanding request.
    pub fn state(&self, sequence_id: u64) -> Option<ResponseState> {
        self.entries.get(&sequence_id).map(|e| e.state)
    }

    /// Resolve a request. Returns `false` for an unknown sequence id.
    pub fn complete(
        &self,
        sequence_id: u64,
        state: ResponseState,
        message: Option<String>,
        value: Option<Value>,
    ) -> bool {
        let Some((_, entry)) = self.entries.remove(&sequence_id) else {
            return false;
        };
        tracing::debug!(
            sequence_id,
            plc_id = %entry.plc_id,
            address = %entry.key,
            from = %entry.state,
            to = %state,
            "Telegram resolved"
        );
        let _ = entry.callback.send(TelegramOutcome {
            sequence_id,
            state,
            message,
            value,
        });
        true
    }

    /// Fail every request addressed to `plc_id`. Returns how many.
    pub fn fail_for_plc(&self, plc_id: &str, message: &str) -> usize {
        let ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| e.plc_id == plc_id)
            .map(|e| *e.key())
            .collect();
        let mut failed = 0;
        for id in ids {
            if self.complete(id, ResponseState::Failed, Some(message.to_string()), None) {
                failed += 1;
            }
        }
        failed
    }

    /// Outstanding requests for `plc_id`.
    pub fn outstanding_for(&self, plc_id: &str) -> usize {
        self.entries.iter().filter(|e| e.plc_id == plc_id).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingResponses {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_resolves_receipt() {
        let pending = PendingResponses::starting_at(100);
        let receipt = pending.insert("plc-1", LogicalKey::new("Conveyor", "On"));
        assert_eq!(receipt.sequence_id, 100);
        assert_eq!(pending.state(100), Some(ResponseState::Pending));

        pending.mark_sent(100);
        assert_eq!(pending.state(100), Some(ResponseState::Sent));

        assert!(pending.complete(100, ResponseState::Done, None, Some(Value::Bool(true))));
        assert!(!pending.complete(100, ResponseState::Done, None, None));

        let outcome = receipt.outcome().await;
        assert_eq!(outcome.state, ResponseState::Done);
        assert_eq!(outcome.value, Some(Value::Bool(true)));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_fail_for_plc_only_touches_that_plc() {
        let pending = PendingResponses::starting_at(1);
        let a = pending.insert("plc-1", LogicalKey::new("Conveyor", "On"));
        let b = pending.insert("plc-2", LogicalKey::new("Conveyor", "On"));

        assert_eq!(pending.fail_for_plc("plc-1", DISCONNECTED), 1);
        assert_eq!(pending.outstanding_for("plc-2"), 1);

        let outcome = a.outcome().await;
        assert_eq!(outcome.state, ResponseState::Failed);
        assert_eq!(outcome.message.as_deref(), Some(DISCONNECTED));
        assert_eq!(b.sequence_id, 2);
    }

    #[test]
    fn test_sequence_seeded_from_clock() {
        let before = chrono::Utc::now().timestamp_millis() as u64;
        let pending = PendingResponses::new();
        let receipt = pending.insert("plc-1", LogicalKey::new("A", "B"));
        assert!(receipt.sequence_id >= before);
    }
}
