//! Thread/child manager
//!
//! Places instances on children, correlates requests with replies, and runs
//! the crash/restart state machine. A child is `alive` while its transport is
//! up; `closing` marks an intentional shutdown so the following close event
//! is not mistaken for a crash.

use futures::future::{join_all, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use threadbound_config::{RuntimeConfig, ThreadMode, ThreadedClassConfig};
use threadbound_ipc::{
    ArgDefinition, CallError, Callback, CallbackRegistry, ChildCommand, ChildMessage,
    ChildProcessOptions, ChildProcessTransport, DecodeContext, EncodeContext, EncodingStrategy,
    InitConfig, InitRequest, InstanceCommand, InstanceMessage, InstanceRef, IpcError, LogLevel,
    MemoryUsage, Message, PropertyDescriptor, RemoteCallbackTable, Reply, ReplyBody,
    SpawnedTransport, TransportEvent, Value,
};
use threadbound_worker::{
    spawn_in_process_worker, spawn_thread_worker, ClassRegistry, PARENT_PID_ENV_VAR,
    WORKER_ENV_VAR,
};

use crate::child::{Child, ChildInstance, PendingReply, ProxyToken, ReplySender, SpawnConfig};
use crate::error::{ThreadedError, ThreadedResult};
use crate::events::{EventHub, EventKind, LifecycleEvent};
use crate::exit;

pub(crate) struct Manager {
    pub config: RuntimeConfig,
    pub registry: Arc<ClassRegistry>,
    pub events: Arc<EventHub>,
    /// In creation order, so pooled placement is first-fit
    children: Mutex<Vec<Arc<Child>>>,
    next_child: AtomicU64,
    next_instance: AtomicU64,
    /// Distinguishes instance ids of this process from those of earlier runs
    nonce: String,
    pub signals_installed: AtomicBool,
}

impl Manager {
    pub fn new(config: RuntimeConfig, registry: Arc<ClassRegistry>) -> Self {
        let mut nonce = uuid::Uuid::new_v4().simple().to_string();
        nonce.truncate(8);
        Self {
            events: Arc::new(EventHub::new(config.strict)),
            config,
            registry,
            children: Mutex::new(Vec::new()),
            next_child: AtomicU64::new(0),
            next_instance: AtomicU64::new(0),
            nonce,
            signals_installed: AtomicBool::new(false),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.children.lock().len()
    }

    fn find_child(&self, id: &str) -> Option<Arc<Child>> {
        self.children.lock().iter().find(|child| child.id == id).cloned()
    }

    fn forget_child(&self, child: &Arc<Child>) {
        self.children
            .lock()
            .retain(|candidate| !Arc::ptr_eq(candidate, child));
    }

    /// Pick the child a new instance goes to, starting one when needed
    pub fn find_next_available_child(
        self: &Arc<Self>,
        config: &ThreadedClassConfig,
    ) -> ThreadedResult<Arc<Child>> {
        let spawn = SpawnConfig {
            mode: if config.disable_multithreading {
                ThreadMode::InProcess
            } else {
                self.config.thread_mode
            },
            worker_path: config
                .path_to_worker
                .clone()
                .or_else(|| self.config.worker_path.clone()),
        };

        if let Some(thread_id) = &config.thread_id {
            if let Some(child) = self.find_child(thread_id) {
                return Ok(child);
            }
            return self.create_child(thread_id.clone(), true, spawn, 0.0);
        }

        if let Some(usage) = config.thread_usage {
            let children = self.children.lock();
            for child in children.iter() {
                if child.is_named
                    || child.spawn.mode != spawn.mode
                    || child.spawn.worker_path != spawn.worker_path
                {
                    continue;
                }
                let mut state = child.state.lock();
                if state.alive && !state.closing && state.usage + usage <= 1.0 + f64::EPSILON {
                    state.usage += usage;
                    debug!("Placing instance on child {} (usage {:.2})", child.id, state.usage);
                    return Ok(child.clone());
                }
            }
        }

        let id = format!("child_{}", self.next_child.fetch_add(1, Ordering::Relaxed));
        self.create_child(id, false, spawn, config.thread_usage.unwrap_or(1.0))
    }

    fn create_child(
        self: &Arc<Self>,
        id: String,
        is_named: bool,
        spawn: SpawnConfig,
        usage: f64,
    ) -> ThreadedResult<Arc<Child>> {
        let child = Arc::new(Child::new(id, is_named, spawn, usage));
        self.launch(&child)?;
        self.children.lock().push(child.clone());

        if child.spawn.mode == ThreadMode::ChildProcess && self.config.handle_exit_signals {
            exit::install(self);
        }
        Ok(child)
    }

    /// Start a fresh worker for `child` and pump its events
    fn launch(self: &Arc<Self>, child: &Arc<Child>) -> ThreadedResult<()> {
        let SpawnedTransport { transport, events } = match child.spawn.mode {
            ThreadMode::ChildProcess => {
                let program = match &child.spawn.worker_path {
                    Some(path) => path.clone(),
                    None => std::env::current_exe().map_err(|e| {
                        ThreadedError::Spawn(format!("cannot locate the current executable: {}", e))
                    })?,
                };
                let options = ChildProcessOptions::new(program)
                    .env(WORKER_ENV_VAR, "1")
                    .env(PARENT_PID_ENV_VAR, std::process::id().to_string());
                ChildProcessTransport::spawn(options)?
            }
            ThreadMode::WorkerThreads => spawn_thread_worker(self.registry.clone(), &child.id)?,
            ThreadMode::InProcess => spawn_in_process_worker(self.registry.clone())?,
        };

        let pid = transport.pid();
        let generation = {
            let mut state = child.state.lock();
            state.generation += 1;
            state.strategy = transport.strategy();
            state.transport = Some(transport);
            state.alive = true;
            state.closing = false;
            state.generation
        };
        info!(
            "Started child {} ({}{})",
            child.id,
            child.spawn.mode,
            pid.map(|pid| format!(", pid {}", pid)).unwrap_or_default()
        );

        tokio::spawn(pump(
            Arc::downgrade(self),
            Arc::downgrade(child),
            generation,
            events,
        ));
        Ok(())
    }

    /// Register an instance on `child`; nothing is sent to the worker yet
    pub fn attach_instance(
        self: &Arc<Self>,
        child: &Arc<Child>,
        module_path: String,
        export_name: String,
        constructor_args: Vec<Value>,
        config: ThreadedClassConfig,
    ) -> Arc<ChildInstance> {
        let id = format!(
            "instance_{}_{}",
            self.nonce,
            self.next_instance.fetch_add(1, Ordering::Relaxed)
        );
        let token = Arc::new(ProxyToken {
            proxy: Default::default(),
        });
        let manager = Arc::downgrade(self);

        let instance = Arc::new_cyclic(|me: &Weak<ChildInstance>| {
            let me = me.clone();
            let remote = RemoteCallbackTable::new(move |callback_id, count| {
                if let (Some(manager), Some(instance)) = (manager.upgrade(), me.upgrade()) {
                    let release = InstanceCommand::ReleaseCallback { callback_id, count };
                    if let Err(e) = manager.notify_instance(&instance, release) {
                        debug!("Callback {} of {} not released: {}", callback_id, instance.id, e);
                    }
                }
            });
            ChildInstance {
                this: InstanceRef::new(token.clone()),
                token,
                id,
                module_path,
                export_name,
                constructor_args,
                config,
                child: Mutex::new(Arc::downgrade(child)),
                initialized: AtomicBool::new(false),
                callbacks: Mutex::new(CallbackRegistry::new()),
                remote,
                monitor: Mutex::new(None),
            }
        });

        child
            .state
            .lock()
            .instances
            .insert(instance.id.clone(), instance.clone());
        debug!("Attached instance {} to child {}", instance.id, child.id);
        instance
    }

    /// Send INIT with the stored constructor arguments and wait for the manifest
    pub async fn send_init(
        self: &Arc<Self>,
        instance: &Arc<ChildInstance>,
    ) -> ThreadedResult<Vec<PropertyDescriptor>> {
        let args = self.encode_args(instance, instance.constructor_args.clone())?;
        let request = InitRequest {
            module_path: instance.module_path.clone(),
            export_name: instance.export_name.clone(),
            args,
            config: InitConfig {
                instance_name: instance.config.instance_name.clone(),
            },
            parent_pid: std::process::id(),
        };

        let rx = self.send_to_instance(instance, InstanceCommand::Init(request), false)?;
        // Calls racing the reply talk to an initializing instance
        instance.set_initialized(true);

        let reply = await_reply(rx, &instance.id).await?;
        if let Some(error) = reply.error {
            instance.set_initialized(false);
            return Err(ThreadedError::Construction(CallError::from_remote(&error)));
        }
        match reply.reply {
            Some(ReplyBody::Props(manifest)) => Ok(manifest),
            _ => {
                instance.set_initialized(false);
                Err(ThreadedError::Construction(CallError::new(
                    "INIT reply carried no property manifest",
                )))
            }
        }
    }

    /// Queue a request for `instance`; the receiver completes with its reply
    pub fn send_to_instance(
        &self,
        instance: &ChildInstance,
        cmd: InstanceCommand,
        require_init: bool,
    ) -> ThreadedResult<oneshot::Receiver<Result<Reply, ThreadedError>>> {
        let child = instance.child().ok_or_else(|| {
            ThreadedError::Closed(format!("Instance \"{}\" has been closed", instance.id))
        })?;

        let mut state = child.state.lock();
        let transport = match &state.transport {
            Some(transport) if state.alive && !state.closing => transport.clone(),
            _ => {
                return Err(ThreadedError::Closed(format!(
                    "Child {} of instance \"{}\" has been closed",
                    child.id, instance.id
                )))
            }
        };
        if require_init && !instance.is_initialized() {
            return Err(ThreadedError::NotInitialized(instance.id.clone()));
        }

        let cmd_id = state.next_cmd_id();
        let (tx, rx) = oneshot::channel();
        state.instance_queue.insert(
            cmd_id,
            PendingReply {
                instance_id: instance.id.clone(),
                sender: tx,
            },
        );

        // Sent under the lock so wire order equals call order
        let message = Message::Instance(InstanceMessage {
            cmd_id,
            instance_id: instance.id.clone(),
            cmd,
        });
        if let Err(e) = transport.send(message) {
            state.instance_queue.remove(&cmd_id);
            return Err(send_error(e));
        }
        Ok(rx)
    }

    /// Send a message that expects no reply
    pub fn notify_instance(
        &self,
        instance: &ChildInstance,
        cmd: InstanceCommand,
    ) -> ThreadedResult<()> {
        let child = instance.child().ok_or_else(|| {
            ThreadedError::Closed(format!("Instance \"{}\" has been closed", instance.id))
        })?;
        let mut state = child.state.lock();
        let transport = match &state.transport {
            Some(transport) if state.alive => transport.clone(),
            _ => {
                return Err(ThreadedError::Closed(format!(
                    "Child {} has been closed",
                    child.id
                )))
            }
        };
        let cmd_id = state.next_cmd_id();
        transport
            .send(Message::Instance(InstanceMessage {
                cmd_id,
                instance_id: instance.id.clone(),
                cmd,
            }))
            .map_err(send_error)
    }

    fn send_to_child(
        &self,
        child: &Child,
        cmd: ChildCommand,
    ) -> ThreadedResult<oneshot::Receiver<Result<Reply, ThreadedError>>> {
        let mut state = child.state.lock();
        let transport = match &state.transport {
            Some(transport) if state.alive && !state.closing => transport.clone(),
            _ => {
                return Err(ThreadedError::Closed(format!(
                    "Child {} has been closed",
                    child.id
                )))
            }
        };
        let cmd_id = state.next_cmd_id();
        let (tx, rx) = oneshot::channel();
        state.child_queue.insert(cmd_id, tx);
        if let Err(e) = transport.send(Message::Child(ChildMessage { cmd_id, cmd })) {
            state.child_queue.remove(&cmd_id);
            return Err(send_error(e));
        }
        Ok(rx)
    }

    /// Send a request and wait for its reply
    pub async fn request(
        &self,
        instance: &ChildInstance,
        cmd: InstanceCommand,
    ) -> ThreadedResult<Reply> {
        let rx = self.send_to_instance(instance, cmd, true)?;
        await_reply(rx, &instance.id).await
    }

    /// Turn a reply into the value it carries
    pub fn value_from_reply(
        self: &Arc<Self>,
        instance: &Arc<ChildInstance>,
        reply: Reply,
    ) -> ThreadedResult<Value> {
        if let Some(error) = reply.error {
            return Err(ThreadedError::Invocation(CallError::from_remote(&error)));
        }
        match reply.reply {
            Some(ReplyBody::Value(definition)) => Ok(self.decoder(instance).decode(definition)?),
            _ => Ok(Value::Undefined),
        }
    }

    fn strategy_of(instance: &ChildInstance) -> EncodingStrategy {
        instance
            .child()
            .map(|child| child.state.lock().strategy)
            .unwrap_or(EncodingStrategy::Json)
    }

    pub fn encode(&self, instance: &ChildInstance, value: Value) -> ThreadedResult<ArgDefinition> {
        let strategy = Self::strategy_of(instance);
        let mut callbacks = instance.callbacks.lock();
        Ok(EncodeContext::new(strategy, &mut callbacks)
            .with_instance(&instance.this)
            .encode(value)?)
    }

    pub fn encode_args(
        &self,
        instance: &ChildInstance,
        args: Vec<Value>,
    ) -> ThreadedResult<Vec<ArgDefinition>> {
        let strategy = Self::strategy_of(instance);
        let mut callbacks = instance.callbacks.lock();
        Ok(EncodeContext::new(strategy, &mut callbacks)
            .with_instance(&instance.this)
            .encode_args(args)?)
    }

    pub fn decoder(self: &Arc<Self>, instance: &Arc<ChildInstance>) -> DecodeContext<'static> {
        let manager = Arc::downgrade(self);
        let owner = Arc::downgrade(instance);
        let this = instance.this.clone();
        DecodeContext::new(move |id| remote_callback(&manager, &owner, id))
            .with_instance(move || Some(this.clone()))
    }

    /// Invoke a function owned by the worker
    async fn call_worker_callback(
        self: &Arc<Self>,
        instance: &Arc<ChildInstance>,
        callback_id: u64,
        args: Vec<Value>,
    ) -> ThreadedResult<Value> {
        let args = self.encode_args(instance, args)?;
        let reply = self
            .request(instance, InstanceCommand::Callback { callback_id, args })
            .await?;
        self.value_from_reply(instance, reply)
    }

    fn handle_message(self: &Arc<Self>, child: &Arc<Child>, message: Message) {
        match message {
            Message::Instance(InstanceMessage {
                cmd_id,
                instance_id,
                cmd,
            }) => match cmd {
                InstanceCommand::Reply(reply) => {
                    let pending = child.state.lock().instance_queue.remove(&reply.reply_to);
                    match pending {
                        Some(pending) => {
                            let _ = pending.sender.send(Ok(reply));
                        }
                        None => warn!(
                            "Reply {} from child {} matches no request",
                            reply.reply_to, child.id
                        ),
                    }
                }
                InstanceCommand::Callback { callback_id, args } => {
                    let instance = child.state.lock().instances.get(&instance_id).cloned();
                    match instance {
                        Some(instance) => {
                            let manager = self.clone();
                            tokio::spawn(async move {
                                manager
                                    .run_callback(instance, cmd_id, callback_id, args)
                                    .await
                            });
                        }
                        None => warn!(
                            "Callback {} requested by unknown instance {}",
                            callback_id, instance_id
                        ),
                    }
                }
                InstanceCommand::ReleaseCallback { callback_id, count } => {
                    let instance = child.state.lock().instances.get(&instance_id).cloned();
                    if let Some(instance) = instance {
                        instance.callbacks.lock().release(callback_id, count);
                    }
                }
                other => warn!(
                    "Unexpected {} from child {} for {}",
                    other.name(),
                    child.id,
                    instance_id
                ),
            },
            Message::Child(ChildMessage { cmd, .. }) => match cmd {
                ChildCommand::Reply(reply) => {
                    let waiter = child.state.lock().child_queue.remove(&reply.reply_to);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(Ok(reply));
                        }
                        None => warn!(
                            "Child reply {} from {} matches no request",
                            reply.reply_to, child.id
                        ),
                    }
                }
                ChildCommand::Log { level, log } => match level {
                    LogLevel::Debug => debug!(child = %child.id, "{}", log),
                    LogLevel::Info => info!(child = %child.id, "{}", log),
                    LogLevel::Warn => warn!(child = %child.id, "{}", log),
                    LogLevel::Error => error!(child = %child.id, "{}", log),
                },
                ChildCommand::GetMemUsage => {
                    warn!("Unexpected GET_MEM_USAGE from child {}", child.id)
                }
            },
        }
    }

    /// Run a parent-side callback on behalf of the worker and reply
    async fn run_callback(
        self: Arc<Self>,
        instance: Arc<ChildInstance>,
        reply_to: u64,
        callback_id: u64,
        args: Vec<ArgDefinition>,
    ) {
        let call = async {
            let callback = instance
                .callbacks
                .lock()
                .get(callback_id)
                .ok_or_else(|| CallError::new(format!("Callback {} not found", callback_id)))?;
            let args = self.decoder(&instance).decode_args(args)?;
            let value = callback.call(args).await?;
            self.encode(&instance, value)
                .map_err(|e| CallError::new(e.to_string()))
        };
        let outcome = AssertUnwindSafe(call)
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(CallError::new("Callback panicked")));

        let (reply, error) = match outcome {
            Ok(value) => (Some(ReplyBody::Value(value)), None),
            Err(e) => (
                None,
                Some(
                    e.with_frame(format!("executing callback of instance \"{}\"", instance.id))
                        .to_string(),
                ),
            ),
        };
        let message = InstanceCommand::Reply(Reply {
            reply_to,
            reply,
            error,
        });
        if let Err(e) = self.notify_instance(&instance, message) {
            warn!("Failed to reply to callback of {}: {}", instance.id, e);
        }
    }

    async fn on_close(self: &Arc<Self>, child: &Arc<Child>, generation: u64, code: Option<i32>) {
        let intentional = {
            let mut state = child.state.lock();
            if state.closing {
                state.alive = false;
                state.transport = None;
            }
            state.closing
        };
        if intentional {
            debug!("Child {} closed", child.id);
            return;
        }
        let reason = match code {
            Some(code) => format!("child {} exited with code {}", child.id, code),
            None => format!("child {} closed unexpectedly", child.id),
        };
        self.child_has_crashed(child, generation, reason).await;
    }

    /// Crash handling: reject everything in flight, then restart or give up
    pub async fn child_has_crashed(
        self: &Arc<Self>,
        child: &Arc<Child>,
        generation: u64,
        reason: String,
    ) {
        let (pending, instances, transport) = {
            let mut state = child.state.lock();
            if state.generation != generation || !state.alive || state.closing {
                return;
            }
            state.alive = false;
            state.generation += 1;
            (
                state.drain_pending(),
                state.instances.values().cloned().collect::<Vec<_>>(),
                state.transport.take(),
            )
        };
        error!("Child {} has crashed: {}", child.id, reason);

        reject_all(pending, &reason);
        for instance in &instances {
            instance.set_initialized(false);
            // The worker's references died with it
            instance.callbacks.lock().clear();
            instance.remote.clear();
        }
        if let Some(transport) = transport {
            tokio::spawn(async move { transport.kill().await });
        }

        for instance in &instances {
            self.emit(EventKind::ThreadClosed, instance, &child.id, &reason);
        }

        if !instances.iter().any(|instance| instance.config.auto_restart) {
            for instance in &instances {
                self.emit(EventKind::Error, instance, &child.id, &reason);
            }
            return;
        }

        match self.restart_child(child, false).await {
            Ok(_) => {
                info!("Child {} restarted after crash", child.id);
                for instance in &instances {
                    self.emit(EventKind::Restarted, instance, &child.id, &reason);
                }
            }
            Err(e) => {
                error!("Failed to restart child {}: {}", child.id, e);
                for instance in &instances {
                    self.emit(EventKind::Error, instance, &child.id, &e.to_string());
                }
            }
        }
    }

    /// Recreate the worker of `child` and re-initialize its instances.
    ///
    /// Returns whether a restart happened; a live child is only restarted
    /// when `force` is set.
    pub async fn restart_child(self: &Arc<Self>, child: &Arc<Child>, force: bool) -> ThreadedResult<bool> {
        if child.state.lock().alive {
            if !force {
                debug!("Child {} is alive, restart skipped", child.id);
                return Ok(false);
            }
            self.stop_worker(child, "child is restarting").await;
        }

        self.launch(child)?;
        let instances: Vec<Arc<ChildInstance>> =
            child.state.lock().instances.values().cloned().collect();
        for instance in &instances {
            instance.set_initialized(false);
        }

        let timeout = instances
            .iter()
            .map(|instance| instance.config.restart_timeout)
            .max()
            .unwrap_or(threadbound_config::domains::runtime::DEFAULT_RESTART_TIMEOUT);
        let inits = join_all(instances.iter().map(|instance| self.send_init(instance)));
        match tokio::time::timeout(timeout, inits).await {
            Err(_) => Err(ThreadedError::RestartTimeout {
                child_id: child.id.clone(),
                timeout,
            }),
            Ok(results) => {
                for result in results {
                    result?;
                }
                Ok(true)
            }
        }
    }

    /// Take the transport down, rejecting everything in flight
    async fn stop_worker(&self, child: &Child, reason: &str) {
        let (pending, transport) = {
            let mut state = child.state.lock();
            state.alive = false;
            state.closing = true;
            state.generation += 1;
            (state.drain_pending(), state.transport.take())
        };
        reject_all(pending, reason);
        if let Some(transport) = transport {
            transport.kill().await;
        }
    }

    /// Kill a child and drop every instance it hosts
    async fn kill_child(self: &Arc<Self>, child: &Arc<Child>, timeout: Duration) {
        let reason = format!("child {} was killed", child.id);
        let (pending, transport, instances) = {
            let mut state = child.state.lock();
            state.alive = false;
            state.closing = true;
            state.generation += 1;
            (
                state.drain_pending(),
                state.transport.take(),
                state.instances.drain().map(|(_, instance)| instance).collect::<Vec<_>>(),
            )
        };
        reject_all(pending, &reason);

        if let Some(transport) = transport {
            if tokio::time::timeout(timeout, transport.kill()).await.is_err() {
                let message = format!(
                    "Child {} did not exit within {}ms",
                    child.id,
                    timeout.as_millis()
                );
                warn!("{}", message);
                for instance in &instances {
                    self.emit(EventKind::Warning, instance, &child.id, &message);
                }
            }
        }

        for instance in &instances {
            instance.detach();
            self.events.forget(&instance.id);
        }
        self.forget_child(child);
        info!("Killed child {}", child.id);
    }

    /// Remove one instance; its child goes too when nothing else lives there
    pub async fn destroy(self: &Arc<Self>, instance: &Arc<ChildInstance>) {
        if let Some(monitor) = instance.monitor.lock().take() {
            monitor.abort();
        }
        let Some(child) = instance.child() else {
            debug!("Instance {} is already destroyed", instance.id);
            self.events.forget(&instance.id);
            return;
        };
        let timeout = instance.config.kill_timeout;

        let others = child
            .state
            .lock()
            .instances
            .keys()
            .any(|id| *id != instance.id);
        if !others {
            self.kill_child(&child, timeout).await;
            return;
        }

        if child.is_usable() {
            match self.send_to_instance(instance, InstanceCommand::Kill, false) {
                Ok(rx) => {
                    if tokio::time::timeout(timeout, rx).await.is_err() {
                        let message = format!(
                            "Instance {} did not acknowledge KILL within {}ms",
                            instance.id,
                            timeout.as_millis()
                        );
                        warn!("{}", message);
                        self.emit(EventKind::Warning, instance, &child.id, &message);
                    }
                }
                Err(e) => debug!("KILL for {} not sent: {}", instance.id, e),
            }
        }

        let pending = {
            let mut state = child.state.lock();
            state.instances.remove(&instance.id);
            if !child.is_named {
                state.usage = (state.usage - instance.usage()).max(0.0);
            }
            state.drain_instance(&instance.id)
        };
        reject_all(pending, &format!("instance {} was destroyed", instance.id));
        instance.detach();
        self.events.forget(&instance.id);
        debug!("Detached instance {} from child {}", instance.id, child.id);
    }

    /// Kill every child concurrently
    pub async fn destroy_all(self: &Arc<Self>) {
        let children = std::mem::take(&mut *self.children.lock());
        let kills = children.iter().map(|child| {
            let timeout = child
                .state
                .lock()
                .instances
                .values()
                .map(|instance| instance.config.kill_timeout)
                .max()
                .unwrap_or(threadbound_config::domains::runtime::DEFAULT_KILL_TIMEOUT);
            self.kill_child(child, timeout)
        });
        join_all(kills).await;
    }

    /// Memory statistics of every live child, keyed by child id
    pub async fn threads_memory_usage(self: &Arc<Self>) -> HashMap<String, MemoryUsage> {
        let children: Vec<Arc<Child>> = self.children.lock().clone();
        let requests = children.iter().map(|child| async move {
            let rx = match self.send_to_child(child, ChildCommand::GetMemUsage) {
                Ok(rx) => rx,
                Err(e) => {
                    debug!("Skipping memory usage of {}: {}", child.id, e);
                    return None;
                }
            };
            match await_reply(rx, &child.id).await {
                Ok(Reply {
                    reply: Some(ReplyBody::MemoryUsage(usage)),
                    ..
                }) => Some((child.id.clone(), usage)),
                Ok(Reply { error, .. }) => {
                    warn!(
                        "Child {} reported no memory usage: {}",
                        child.id,
                        error.unwrap_or_default()
                    );
                    None
                }
                Err(e) => {
                    warn!("Memory usage of {} unavailable: {}", child.id, e);
                    None
                }
            }
        });
        join_all(requests).await.into_iter().flatten().collect()
    }

    pub fn emit(&self, kind: EventKind, instance: &ChildInstance, child_id: &str, message: &str) {
        self.events
            .emit(LifecycleEvent::new(kind, &instance.id, child_id).with_message(message));
    }
}

async fn await_reply(
    rx: oneshot::Receiver<Result<Reply, ThreadedError>>,
    instance_id: &str,
) -> ThreadedResult<Reply> {
    rx.await.map_err(|_| {
        ThreadedError::MethodAborted(format!("request to {} was dropped", instance_id))
    })?
}

fn reject_all(pending: Vec<ReplySender>, reason: &str) {
    for sender in pending {
        let _ = sender.send(Err(ThreadedError::MethodAborted(reason.to_string())));
    }
}

fn send_error(err: IpcError) -> ThreadedError {
    match err {
        IpcError::SerializationError(e) => ThreadedError::UnsupportedAttribute(format!(
            "value cannot be sent to the worker (circular structure?): {}",
            e
        )),
        other => other.into(),
    }
}

/// Redeem a callback id received from the worker
fn remote_callback(
    manager: &Weak<Manager>,
    owner: &Weak<ChildInstance>,
    callback_id: u64,
) -> Callback {
    let Some(instance) = owner.upgrade() else {
        return Callback::from_fn(move |_| {
            Err(CallError::new(format!(
                "Callback {} can no longer be called: instance is gone",
                callback_id
            )))
        });
    };

    let manager = manager.clone();
    let owner = owner.clone();
    instance.remote.resolve(callback_id, move |args| {
        let manager = manager.upgrade();
        let instance = owner.upgrade();
        async move {
            match (manager, instance) {
                (Some(manager), Some(instance)) => manager
                    .call_worker_callback(&instance, callback_id, args)
                    .await
                    .map_err(|e| match e {
                        ThreadedError::Invocation(e) => e,
                        other => CallError::new(other.to_string()),
                    }),
                _ => Err(CallError::new(format!(
                    "Callback {} can no longer be called: instance is gone",
                    callback_id
                ))),
            }
        }
        .boxed()
    })
}

/// Forward transport events of one worker generation to the manager
async fn pump(
    manager: Weak<Manager>,
    child: Weak<Child>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let (Some(manager), Some(child)) = (manager.upgrade(), child.upgrade()) else {
            break;
        };
        if child.state.lock().generation != generation {
            debug!("Dropping event of a replaced worker of child {}", child.id);
            break;
        }
        match event {
            TransportEvent::Message(message) => manager.handle_message(&child, message),
            TransportEvent::Error(e) => {
                error!("Worker of child {} failed: {}", child.id, e);
                tokio::spawn(async move {
                    manager
                        .child_has_crashed(&child, generation, format!("worker error: {}", e))
                        .await
                });
                break;
            }
            TransportEvent::Close { code } => {
                tokio::spawn(async move { manager.on_close(&child, generation, code).await });
                break;
            }
        }
    }
}
