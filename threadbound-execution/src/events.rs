//! Lifecycle events emitted per proxied instance

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, warn};

/// Kinds of lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The child hosting the instance went away
    ThreadClosed,
    Error,
    /// The child was restarted and the instance re-created
    Restarted,
    Warning,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::ThreadClosed => "thread_closed",
            EventKind::Error => "error",
            EventKind::Restarted => "restarted",
            EventKind::Warning => "warning",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub instance_id: String,
    pub child_id: String,
    pub message: Option<String>,
}

impl LifecycleEvent {
    pub fn new(kind: EventKind, instance_id: &str, child_id: &str) -> Self {
        Self {
            kind,
            instance_id: instance_id.to_string(),
            child_id: child_id.to_string(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

pub type Listener = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

struct Registration {
    id: u64,
    kind: EventKind,
    listener: Listener,
}

/// Listener table shared by the manager and subscriptions
pub(crate) struct EventHub {
    strict: bool,
    next_id: AtomicU64,
    listeners: Mutex<HashMap<String, Vec<Registration>>>,
}

impl EventHub {
    pub(crate) fn new(strict: bool) -> Self {
        Self {
            strict,
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn subscribe(
        self: &Arc<Self>,
        instance_id: &str,
        kind: EventKind,
        listener: Listener,
    ) -> EventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .entry(instance_id.to_string())
            .or_default()
            .push(Registration { id, kind, listener });
        EventSubscription {
            hub: Arc::downgrade(self),
            instance_id: instance_id.to_string(),
            id,
        }
    }

    fn unsubscribe(&self, instance_id: &str, id: u64) {
        let mut listeners = self.listeners.lock();
        if let Some(registrations) = listeners.get_mut(instance_id) {
            registrations.retain(|registration| registration.id != id);
            if registrations.is_empty() {
                listeners.remove(instance_id);
            }
        }
    }

    /// Drop every listener of a destroyed instance
    pub(crate) fn forget(&self, instance_id: &str) {
        self.listeners.lock().remove(instance_id);
    }

    pub(crate) fn emit(&self, event: LifecycleEvent) {
        // Listeners run without the lock so they may subscribe or stop
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .get(&event.instance_id)
            .map(|registrations| {
                registrations
                    .iter()
                    .filter(|registration| registration.kind == event.kind)
                    .map(|registration| registration.listener.clone())
                    .collect()
            })
            .unwrap_or_default();

        if listeners.is_empty() {
            if self.strict {
                warn!(
                    "No listener for \"{}\" event of instance {}: {}",
                    event.kind,
                    event.instance_id,
                    event.message.as_deref().unwrap_or("")
                );
            }
            return;
        }

        for listener in listeners {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!(
                    "Listener for \"{}\" event of instance {} panicked",
                    event.kind, event.instance_id
                );
            }
        }
    }

    #[cfg(test)]
    fn listener_count(&self, instance_id: &str) -> usize {
        self.listeners
            .lock()
            .get(instance_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Handle returned by `on_event`; call [`EventSubscription::stop`] to unsubscribe
#[must_use = "dropping the subscription keeps the listener registered; call stop() to remove it"]
pub struct EventSubscription {
    hub: Weak<EventHub>,
    instance_id: String,
    id: u64,
}

impl EventSubscription {
    pub fn stop(self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(&self.instance_id, self.id);
        }
    }
}
