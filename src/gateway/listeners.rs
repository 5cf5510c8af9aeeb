//! Listener registry.
//!
//! Multimap from logical key to an ordered list of listeners. Registration
//! order within a key is delivery order. Delivery works on a copy of the
//! list so a listener may (un)register, itself included, while being called.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::core::address::{LogicalAddress, LogicalKey};
use crate::core::data::Value;
use crate::core::logging::LogContext;
use crate::core::traits::{AddressListener, ListenerId};

type Entry = (ListenerId, Arc<dyn AddressListener>);

/// Listener registry, shared between the Handler and the runtime.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: DashMap<LogicalKey, Vec<Entry>>,
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener for `key`.
    pub fn register(&self, key: LogicalKey, listener: Arc<dyn AddressListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.listeners.entry(key).or_default().push((id, listener));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut found = None;
        for mut entry in self.listeners.iter_mut() {
            let list = entry.value_mut();
            if let Some(pos) = list.iter().position(|(lid, _)| *lid == id) {
                list.remove(pos);
                found = Some(entry.key().clone());
                break;
            }
        }

        match found {
            Some(key) => {
                self.listeners.remove_if(&key, |_, list| list.is_empty());
                true
            }
            None => false,
        }
    }

    /// Copy of the listeners for `key`, in registration order.
    pub fn snapshot(&self, key: &LogicalKey) -> Vec<Arc<dyn AddressListener>> {
        self.listeners
            .get(key)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    /// Number of listeners for `key`.
    pub fn count(&self, key: &LogicalKey) -> usize {
        self.listeners.get(key).map(|l| l.len()).unwrap_or(0)
    }

    /// Keys with at least one listener.
    pub fn keys(&self) -> Vec<LogicalKey> {
        self.listeners.iter().map(|e| e.key().clone()).collect()
    }

    /// Total number of listeners.
    pub fn len(&self) -> usize {
        self.listeners.iter().map(|e| e.value().len()).sum()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every listener for `address` in registration order.
    ///
    /// Each call is isolated: an error or panic is logged and the remaining
    /// listeners still run. Returns the number of failed listeners.
    pub fn deliver(&self, address: &LogicalAddress, value: &Value, log: &LogContext) -> usize {
        let listeners = self.snapshot(&address.key);
        let mut errors = 0;

        for listener in listeners {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_value(address, value)
            }));

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    errors += 1;
                    log.listener_failed(&address.key, e.to_string());
                }
                Err(panic) => {
                    errors += 1;
                    log.listener_failed(&address.key, panic_message(&panic));
                }
            }
        }

        errors
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::AddressKind;
    use crate::core::data::ValueType;
    use crate::core::error::{GatewayError, Result};
    use crate::core::logging::{RecordingLogHandler, StateEvent};
    use std::sync::Mutex;

    fn address(resource: &str) -> LogicalAddress {
        LogicalAddress::new(
            LogicalKey::new(resource, "Open"),
            AddressKind::Notification,
            "DI.1",
            ValueType::Boolean,
        )
    }

    fn recorder(seen: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Arc<dyn AddressListener> {
        let seen = Arc::clone(seen);
        Arc::new(move |_: &LogicalAddress, _: &Value| -> Result<()> {
            seen.lock().unwrap().push(tag);
            Ok(())
        })
    }

    #[test]
    fn test_registration_order_is_delivery_order() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let door = address("Door");

        registry.register(door.key.clone(), recorder(&seen, "a"));
        registry.register(door.key.clone(), recorder(&seen, "b"));
        registry.register(door.key.clone(), recorder(&seen, "c"));

        registry.deliver(&door, &Value::Bool(true), &LogContext::default());
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_failing_listeners_are_isolated() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let door = address("Door");
        let log_events = Arc::new(RecordingLogHandler::new());
        let log = LogContext::new(log_events.clone());

        registry.register(
            door.key.clone(),
            Arc::new(|_: &LogicalAddress, _: &Value| -> Result<()> {
                Err(GatewayError::Io("listener broke".into()))
            }),
        );
        registry.register(
            door.key.clone(),
            Arc::new(|_: &LogicalAddress, _: &Value| -> Result<()> { panic!("listener panicked") }),
        );
        registry.register(door.key.clone(), recorder(&seen, "after"));

        let errors = registry.deliver(&door, &Value::Bool(true), &log);
        assert_eq!(errors, 2);
        assert_eq!(*seen.lock().unwrap(), vec!["after"]);

        let failures = log_events
            .events()
            .into_iter()
            .filter(|e| matches!(e, StateEvent::ListenerFailed { .. }))
            .count();
        assert_eq!(failures, 2);
    }

    #[test]
    fn test_unregister() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let door = address("Door");

        let a = registry.register(door.key.clone(), recorder(&seen, "a"));
        let b = registry.register(door.key.clone(), recorder(&seen, "b"));
        assert_ne!(a, b);

        assert!(registry.unregister(a));
        assert!(!registry.unregister(a));
        assert_eq!(registry.count(&door.key), 1);

        assert!(registry.unregister(b));
        assert!(registry.is_empty());
        assert!(registry.keys().is_empty());
    }

    #[test]
    fn test_listener_may_unregister_itself_during_delivery() {
        let registry = Arc::new(ListenerRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let door = address("Door");
        let own_id = Arc::new(Mutex::new(None::<ListenerId>));

        let handle = Arc::clone(&registry);
        let own = Arc::clone(&own_id);
        let id = registry.register(
            door.key.clone(),
            Arc::new(move |_: &LogicalAddress, _: &Value| -> Result<()> {
                let id = *own.lock().unwrap();
                if let Some(id) = id {
                    handle.unregister(id);
                }
                Ok(())
            }),
        );
        *own_id.lock().unwrap() = Some(id);
        registry.register(door.key.clone(), recorder(&seen, "second"));

        registry.deliver(&door, &Value::Bool(true), &LogContext::default());
        assert_eq!(*seen.lock().unwrap(), vec!["second"]);
        assert_eq!(registry.count(&door.key), 1);
    }
}
