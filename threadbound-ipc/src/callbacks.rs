//! Callback bookkeeping on both ends of a connection
//!
//! [`CallbackRegistry`] holds functions this side has exported, keyed by the id
//! the other side uses to call them. [`RemoteCallbackTable`] redeems ids
//! received from the other side into shared [`Callback`] handles and reports,
//! once the last handle is dropped, how many times the id was received so the
//! owner can release its export.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::error::CallError;
use crate::value::{Callback, Value, WeakCallback};

struct ExportedCallback {
    callback: Callback,
    exported: u64,
}

/// Functions exported to the other side, by callback id
#[derive(Default)]
pub struct CallbackRegistry {
    next_id: u64,
    entries: HashMap<u64, ExportedCallback>,
    ids_by_addr: HashMap<usize, u64>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback, reusing the id of an identical one
    pub fn register(&mut self, callback: &Callback) -> u64 {
        if let Some(id) = self.ids_by_addr.get(&callback.addr()).copied() {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.exported += 1;
                return id;
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            ExportedCallback {
                callback: callback.clone(),
                exported: 1,
            },
        );
        self.ids_by_addr.insert(callback.addr(), id);
        id
    }

    pub fn get(&self, id: u64) -> Option<Callback> {
        self.entries.get(&id).map(|entry| entry.callback.clone())
    }

    /// Account for `count` references dropped by the other side.
    ///
    /// Returns true when the callback was removed.
    pub fn release(&mut self, id: u64, count: u64) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        entry.exported = entry.exported.saturating_sub(count);
        if entry.exported > 0 {
            return false;
        }
        if let Some(entry) = self.entries.remove(&id) {
            self.ids_by_addr.remove(&entry.callback.addr());
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.ids_by_addr.clear();
    }
}

type ReleaseFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

struct RemoteEntry {
    callback: WeakCallback,
    received: u64,
    generation: u64,
}

#[derive(Default)]
struct RemoteInner {
    entries: HashMap<u64, RemoteEntry>,
    next_generation: u64,
}

/// Handles for callbacks owned by the other side, shared per id
#[derive(Clone)]
pub struct RemoteCallbackTable {
    inner: Arc<Mutex<RemoteInner>>,
    on_release: ReleaseFn,
}

impl RemoteCallbackTable {
    /// `on_release(id, count)` runs once every handle for `id` is gone
    pub fn new(on_release: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RemoteInner::default())),
            on_release: Arc::new(on_release),
        }
    }

    /// Redeem a received callback id.
    ///
    /// While a handle for `id` is alive it is shared; otherwise a new one is
    /// built around `invoke`.
    pub fn resolve<F>(&self, id: u64, invoke: F) -> Callback
    where
        F: Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, CallError>> + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&id) {
            if let Some(callback) = entry.callback.upgrade() {
                entry.received += 1;
                return callback;
            }
        }

        // A dead entry whose guard has not run yet hands its count over
        let carried = inner
            .entries
            .remove(&id)
            .map(|entry| entry.received)
            .unwrap_or(0);
        let generation = inner.next_generation;
        inner.next_generation += 1;

        let guard = ReleaseGuard {
            id,
            generation,
            table: Arc::downgrade(&self.inner),
            on_release: self.on_release.clone(),
        };
        let callback = Callback::new(move |args| {
            let _held = &guard;
            invoke(args)
        });

        inner.entries.insert(
            id,
            RemoteEntry {
                callback: callback.downgrade(),
                received: carried + 1,
                generation,
            },
        );
        callback
    }

    /// Number of ids with a live handle
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|entry| entry.callback.upgrade().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every entry without reporting releases
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }
}

struct ReleaseGuard {
    id: u64,
    generation: u64,
    table: Weak<Mutex<RemoteInner>>,
    on_release: ReleaseFn,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let released = {
            let mut inner = table.lock();
            match inner.entries.get(&self.id) {
                Some(entry) if entry.generation == self.generation => {
                    inner.entries.remove(&self.id).map(|entry| entry.received)
                }
                _ => None,
            }
        };
        if let Some(count) = released {
            (self.on_release)(self.id, count);
        }
    }
}
