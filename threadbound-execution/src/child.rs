//! Parent-side records of workers ("children") and the instances they host

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use threadbound_config::{ThreadMode, ThreadedClassConfig};
use threadbound_ipc::{
    CallbackRegistry, EncodingStrategy, InstanceRef, RemoteCallbackTable, Reply, Value,
    WorkerTransport,
};

use crate::error::ThreadedError;
use crate::proxy::ProxyInner;

pub(crate) type ReplySender = oneshot::Sender<Result<Reply, ThreadedError>>;

/// How a child's worker is started; kept so a restart recreates it identically
#[derive(Debug, Clone)]
pub(crate) struct SpawnConfig {
    pub mode: ThreadMode,
    pub worker_path: Option<PathBuf>,
}

/// Outstanding request waiting for a REPLY
pub(crate) struct PendingReply {
    pub instance_id: String,
    pub sender: ReplySender,
}

pub(crate) struct ChildState {
    /// Share of the child reserved by unnamed instances, 0 to 1
    pub usage: f64,
    pub instances: HashMap<String, Arc<ChildInstance>>,
    pub alive: bool,
    pub closing: bool,
    pub cmd_id: u64,
    pub instance_queue: HashMap<u64, PendingReply>,
    pub child_queue: HashMap<u64, ReplySender>,
    pub transport: Option<Arc<dyn WorkerTransport>>,
    pub strategy: EncodingStrategy,
    /// Bumped whenever the transport is replaced or dropped; events of an
    /// older generation are ignored
    pub generation: u64,
}

impl ChildState {
    pub fn next_cmd_id(&mut self) -> u64 {
        let id = self.cmd_id;
        self.cmd_id += 1;
        id
    }

    /// Take every outstanding request, leaving the queues empty
    pub fn drain_pending(&mut self) -> Vec<ReplySender> {
        let mut senders: Vec<ReplySender> = self
            .instance_queue
            .drain()
            .map(|(_, pending)| pending.sender)
            .collect();
        senders.extend(self.child_queue.drain().map(|(_, sender)| sender));
        senders
    }

    /// Take the outstanding requests of one instance
    pub fn drain_instance(&mut self, instance_id: &str) -> Vec<ReplySender> {
        let ids: Vec<u64> = self
            .instance_queue
            .iter()
            .filter(|(_, pending)| pending.instance_id == instance_id)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.instance_queue.remove(&id))
            .map(|pending| pending.sender)
            .collect()
    }
}

/// A worker hosting one or more instances
pub(crate) struct Child {
    pub id: String,
    /// Created for an explicit `thread_id`; never used for pooled placement
    pub is_named: bool,
    pub spawn: SpawnConfig,
    pub state: Mutex<ChildState>,
}

impl Child {
    pub fn new(id: String, is_named: bool, spawn: SpawnConfig, usage: f64) -> Self {
        Self {
            id,
            is_named,
            spawn,
            state: Mutex::new(ChildState {
                usage,
                instances: HashMap::new(),
                alive: false,
                closing: false,
                cmd_id: 0,
                instance_queue: HashMap::new(),
                child_queue: HashMap::new(),
                transport: None,
                strategy: EncodingStrategy::Json,
                generation: 0,
            }),
        }
    }

    pub fn is_usable(&self) -> bool {
        let state = self.state.lock();
        state.alive && !state.closing
    }

    /// The worker died and nobody is tearing the child down
    pub fn has_crashed(&self) -> bool {
        let state = self.state.lock();
        !state.alive && !state.closing
    }
}

/// Identity of a proxy; what a proxy turns into when passed as a value
pub(crate) struct ProxyToken {
    pub proxy: OnceLock<Weak<ProxyInner>>,
}

/// Binding of one proxy to the object living inside a child
pub(crate) struct ChildInstance {
    pub id: String,
    pub token: Arc<ProxyToken>,
    pub this: InstanceRef,
    pub module_path: String,
    pub export_name: String,
    pub constructor_args: Vec<Value>,
    pub config: ThreadedClassConfig,
    /// Empty once the instance is detached
    pub child: Mutex<Weak<Child>>,
    pub initialized: AtomicBool,
    /// Parent-side functions the worker may call back
    pub callbacks: Mutex<CallbackRegistry>,
    /// Worker-side functions redeemed on this side
    pub remote: RemoteCallbackTable,
    pub monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ChildInstance {
    pub fn child(&self) -> Option<Arc<Child>> {
        self.child.lock().upgrade()
    }

    pub fn detach(&self) {
        *self.child.lock() = Weak::new();
        self.initialized.store(false, Ordering::SeqCst);
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::SeqCst);
    }

    /// Share of a child this instance reserves when placed in the pool
    pub fn usage(&self) -> f64 {
        self.config.thread_usage.unwrap_or(1.0)
    }
}
