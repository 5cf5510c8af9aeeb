//! Notification buffer for disconnected periods.

use std::collections::HashMap;

use crate::core::address::LogicalKey;
use crate::core::data::Value;

/// Last-value-wins buffer keyed by address.
///
/// Keys keep the order in which they were first buffered; a later value for
/// the same key replaces the earlier one in place.
#[derive(Debug, Default)]
pub struct NotificationBuffer {
    order: Vec<LogicalKey>,
    values: HashMap<LogicalKey, Value>,
}

impl NotificationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a value. Returns `true` if the key was not buffered yet.
    pub fn push(&mut self, key: LogicalKey, value: Value) -> bool {
        match self.values.insert(key.clone(), value) {
            Some(_) => false,
            None => {
                self.order.push(key);
                true
            }
        }
    }

    /// Take everything, in first-seen order.
    pub fn drain(&mut self) -> Vec<(LogicalKey, Value)> {
        let mut values = std::mem::take(&mut self.values);
        std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|key| values.remove(&key).map(|value| (key, value)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
