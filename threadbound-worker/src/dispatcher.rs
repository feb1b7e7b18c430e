//! Worker-side dispatcher
//!
//! Executes incoming instance commands against the objects living in this
//! worker and sends replies back through an outbound sink. Every command
//! that expects a reply gets exactly one, even when the method panics.

use futures::future::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use threadbound_ipc::{
    ArgDefinition, CallError, Callback, CallbackRegistry, ChildCommand, ChildMessage,
    DecodeContext, EncodeContext, EncodingStrategy, InitRequest, InstanceCommand,
    InstanceMessage, InstanceRef, IpcError, LogLevel, MemoryUsage, Message, RemoteCallbackTable,
    Reply, ReplyBody, Value,
};

use crate::class::{ClassDescriptor, ClassRegistry, InstanceCell, ThreadedObject};

/// Where the dispatcher puts messages for the parent
pub type Outbound = Arc<dyn Fn(Message) -> Result<(), IpcError> + Send + Sync>;

/// Hooks into the environment hosting the dispatcher
pub struct WorkerHost {
    exit: Box<dyn Fn(i32) + Send + Sync>,
    watch_parent: Option<Box<dyn Fn(u32) + Send + Sync>>,
}

impl WorkerHost {
    /// `exit` terminates the worker with the given code
    pub fn new(exit: impl Fn(i32) + Send + Sync + 'static) -> Self {
        Self {
            exit: Box::new(exit),
            watch_parent: None,
        }
    }

    /// Called once with the parent pid carried by the first INIT
    pub fn with_parent_watch(mut self, watch: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.watch_parent = Some(Box::new(watch));
        self
    }
}

/// What a method sees of its surroundings
#[derive(Clone)]
pub struct CallContext {
    instance_id: Arc<str>,
    this: InstanceRef,
    dispatcher: Weak<DispatcherInner>,
}

impl CallContext {
    /// Reference to the instance being called; encodes as a self reference
    pub fn this(&self) -> InstanceRef {
        self.this.clone()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Forward a log line to the parent
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.send_log(level, message.into());
        }
    }

    /// Terminate the whole worker
    pub fn exit(&self, code: i32) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            (dispatcher.host.exit)(code);
        }
    }
}

struct InstanceHandle {
    id: Arc<str>,
    cmd_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    cell: Arc<InstanceCell>,
    this: InstanceRef,
    callbacks: Mutex<CallbackRegistry>,
    remote: RemoteCallbackTable,
    descriptor: OnceLock<Arc<ClassDescriptor>>,
}

impl InstanceHandle {
    fn new(id: &str, dispatcher: Weak<DispatcherInner>) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<InstanceHandle>| {
            let me = me.clone();
            let remote = RemoteCallbackTable::new(move |callback_id, count| {
                if let (Some(handle), Some(dispatcher)) = (me.upgrade(), dispatcher.upgrade()) {
                    dispatcher.send_to_parent(
                        &handle,
                        InstanceCommand::ReleaseCallback { callback_id, count },
                    );
                }
            });
            let cell = Arc::new(InstanceCell::default());
            Self {
                id: Arc::from(id),
                cmd_id: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                this: InstanceRef::new(cell.clone()),
                cell,
                callbacks: Mutex::new(CallbackRegistry::new()),
                remote,
                descriptor: OnceLock::new(),
            }
        })
    }

    fn next_cmd_id(&self) -> u64 {
        self.cmd_id.fetch_add(1, Ordering::Relaxed)
    }

    fn object(&self) -> Result<Arc<dyn ThreadedObject>, CallError> {
        self.cell
            .get()
            .cloned()
            .ok_or_else(|| CallError::new(format!("Instance \"{}\" is not initialized", self.id)))
    }
}

/// Executes commands for every instance hosted by one worker
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: Arc<ClassRegistry>,
    strategy: EncodingStrategy,
    outbound: Outbound,
    host: WorkerHost,
    instances: Mutex<HashMap<String, Arc<InstanceHandle>>>,
    child_cmd_id: AtomicU64,
    tasks: Mutex<JoinSet<()>>,
    parent_watched: AtomicBool,
}

enum ReplyAddress {
    Instance { instance_id: String, reply_to: u64 },
    Child { reply_to: u64 },
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ClassRegistry>,
        strategy: EncodingStrategy,
        outbound: Outbound,
        host: WorkerHost,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                registry,
                strategy,
                outbound,
                host,
                instances: Mutex::new(HashMap::new()),
                child_cmd_id: AtomicU64::new(0),
                tasks: Mutex::new(JoinSet::new()),
                parent_watched: AtomicBool::new(false),
            }),
        }
    }

    /// Handle one inbound message. Must be called from within a tokio runtime.
    pub fn handle(&self, message: Message) {
        let expects_reply = message.expects_reply();
        let command = message.command_name();
        let address = match &message {
            Message::Instance(msg) => ReplyAddress::Instance {
                instance_id: msg.instance_id.clone(),
                reply_to: msg.cmd_id,
            },
            Message::Child(msg) => ReplyAddress::Child {
                reply_to: msg.cmd_id,
            },
        };

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| self.inner.route(message)));
        if let Err(panic) = outcome {
            let reason = panic_message(panic);
            if expects_reply {
                self.inner.reply_with_error(address, reason);
            } else {
                error!("Panic while handling {}: {}", command, reason);
            }
        }
    }

    pub fn instance_count(&self) -> usize {
        self.inner.instances.lock().len()
    }

    /// Abort running commands and drop every instance
    pub fn shutdown(&self) {
        self.inner.tasks.lock().abort_all();
        let instances = std::mem::take(&mut *self.inner.instances.lock());
        for handle in instances.values() {
            handle.pending.lock().clear();
        }
        drop(instances);
    }
}

impl DispatcherInner {
    fn route(self: &Arc<Self>, message: Message) {
        match message {
            Message::Instance(InstanceMessage {
                cmd_id,
                instance_id,
                cmd,
            }) => {
                debug!("Worker received {} for {}", cmd.name(), instance_id);
                // Only INIT creates an instance
                let found = if matches!(cmd, InstanceCommand::Init(_)) {
                    Some(self.handle_for(&instance_id))
                } else {
                    self.instances.lock().get(&instance_id).cloned()
                };
                let handle = match found {
                    Some(handle) => handle,
                    None => {
                        match cmd {
                            InstanceCommand::Reply(_) | InstanceCommand::ReleaseCallback { .. } => {
                                debug!("Dropping {} for unknown instance {}", cmd.name(), instance_id)
                            }
                            _ => self.reply_with_error(
                                ReplyAddress::Instance {
                                    instance_id: instance_id.clone(),
                                    reply_to: cmd_id,
                                },
                                format!("Instance \"{}\" not found", instance_id),
                            ),
                        }
                        return;
                    }
                };
                match cmd {
                    InstanceCommand::Init(request) => self.init(&handle, cmd_id, request),
                    InstanceCommand::Ping => self.reply(&handle, cmd_id, Ok(None)),
                    InstanceCommand::Function { fcn, args } => {
                        let this = self.clone();
                        self.spawn(async move { this.invoke(handle, cmd_id, fcn, args).await });
                    }
                    InstanceCommand::Set { property, value } => {
                        let result = self.set_property(&handle, &property, value);
                        self.reply(&handle, cmd_id, result);
                    }
                    InstanceCommand::Kill => {
                        let removed = self.instances.lock().remove(&instance_id);
                        if let Some(removed) = &removed {
                            removed.pending.lock().clear();
                        }
                        self.reply(&handle, cmd_id, Ok(None));
                    }
                    InstanceCommand::Callback { callback_id, args } => {
                        let this = self.clone();
                        self.spawn(async move {
                            this.run_callback(handle, cmd_id, callback_id, args).await
                        });
                    }
                    InstanceCommand::ReleaseCallback { callback_id, count } => {
                        handle.callbacks.lock().release(callback_id, count);
                    }
                    InstanceCommand::Reply(reply) => {
                        let waiter = handle.pending.lock().remove(&reply.reply_to);
                        match waiter {
                            Some(waiter) => {
                                let _ = waiter.send(reply);
                            }
                            None => warn!(
                                "Reply {} for instance {} matches no request",
                                reply.reply_to, instance_id
                            ),
                        }
                    }
                }
            }
            Message::Child(ChildMessage { cmd_id, cmd }) => match cmd {
                ChildCommand::GetMemUsage => {
                    let result = current_memory_usage()
                        .map(|usage| Some(ReplyBody::MemoryUsage(usage)))
                        .ok_or_else(|| "Memory statistics are unavailable".to_string());
                    self.reply_to_child(cmd_id, result);
                }
                ChildCommand::Log { .. } | ChildCommand::Reply(_) => {
                    debug!("Worker ignores {} from parent", cmd.name());
                }
            },
        }
    }

    fn handle_for(self: &Arc<Self>, instance_id: &str) -> Arc<InstanceHandle> {
        self.instances
            .lock()
            .entry(instance_id.to_string())
            .or_insert_with(|| InstanceHandle::new(instance_id, Arc::downgrade(self)))
            .clone()
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    fn init(self: &Arc<Self>, handle: &Arc<InstanceHandle>, reply_to: u64, request: InitRequest) {
        if let Some(watch) = &self.host.watch_parent {
            if !self.parent_watched.swap(true, Ordering::SeqCst) {
                watch(request.parent_pid);
            }
        }

        let export = request.export_name.clone();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| self.construct(handle, request)))
            .unwrap_or_else(|panic| Err(CallError::new(panic_message(panic))))
            .map(Some)
            .map_err(|e| {
                e.with_frame(format!("constructing \"{}\" as instance \"{}\"", export, handle.id))
                    .to_string()
            });
        self.reply(handle, reply_to, result);
    }

    fn construct(
        self: &Arc<Self>,
        handle: &Arc<InstanceHandle>,
        request: InitRequest,
    ) -> Result<ReplyBody, CallError> {
        let class = self
            .registry
            .resolve(&request.module_path, &request.export_name)
            .map_err(|e| CallError::new(e.to_string()))?;

        // Arguments may refer to the instance under construction
        let args = self.decoder(handle).decode_args(request.args)?;
        let ctx = self.context(handle);
        let object = (class.constructor)(&ctx, args)?;

        if !handle.cell.fill(object) {
            return Err(CallError::new(format!(
                "Instance \"{}\" is already initialized",
                handle.id
            )));
        }
        let _ = handle.descriptor.set(class.descriptor.clone());

        debug!(
            "Constructed {} ({}) as {}{}",
            request.export_name,
            request.module_path,
            handle.id,
            request
                .config
                .instance_name
                .map(|name| format!(" \"{}\"", name))
                .unwrap_or_default()
        );
        Ok(ReplyBody::Props(class.descriptor.manifest()))
    }

    async fn invoke(
        self: Arc<Self>,
        handle: Arc<InstanceHandle>,
        reply_to: u64,
        fcn: String,
        args: Vec<ArgDefinition>,
    ) {
        let outcome = AssertUnwindSafe(self.run_method(&handle, &fcn, args))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(CallError::new(panic_message(panic))));

        let result = outcome
            .map(|value| Some(ReplyBody::Value(value)))
            .map_err(|e| {
                e.with_frame(format!(
                    "executing function \"{}\" of instance \"{}\"",
                    fcn, handle.id
                ))
                .to_string()
            });
        self.reply(&handle, reply_to, result);
    }

    async fn run_method(
        self: &Arc<Self>,
        handle: &Arc<InstanceHandle>,
        fcn: &str,
        args: Vec<ArgDefinition>,
    ) -> Result<ArgDefinition, CallError> {
        let object = handle.object()?;
        let args = self.decoder(handle).decode_args(args)?;
        let ctx = self.context(handle);

        // Reading a value member through FUNCTION yields the value itself
        let is_value = handle
            .descriptor
            .get()
            .and_then(|descriptor| descriptor.lookup(fcn))
            .is_some_and(|member| !member.is_function());
        let value = if is_value {
            object.get(&ctx, fcn)?
        } else {
            object.call(&ctx, fcn, args).await?
        };

        self.encode(handle, value)
    }

    async fn run_callback(
        self: Arc<Self>,
        handle: Arc<InstanceHandle>,
        reply_to: u64,
        callback_id: u64,
        args: Vec<ArgDefinition>,
    ) {
        let call = async {
            let callback = handle
                .callbacks
                .lock()
                .get(callback_id)
                .ok_or_else(|| CallError::new(format!("Callback {} not found", callback_id)))?;
            let args = self.decoder(&handle).decode_args(args)?;
            let value = callback.call(args).await?;
            self.encode(&handle, value)
        };
        let outcome = AssertUnwindSafe(call)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(CallError::new(panic_message(panic))));

        let result = outcome
            .map(|value| Some(ReplyBody::Value(value)))
            .map_err(|e| {
                e.with_frame(format!("executing callback of instance \"{}\"", handle.id))
                    .to_string()
            });
        self.reply(&handle, reply_to, result);
    }

    fn set_property(
        self: &Arc<Self>,
        handle: &Arc<InstanceHandle>,
        property: &str,
        value: ArgDefinition,
    ) -> Result<Option<ReplyBody>, String> {
        let assign = || -> Result<ArgDefinition, CallError> {
            let object = handle.object()?;
            let value = self.decoder(handle).decode(value)?;
            let ctx = self.context(handle);
            object.set(&ctx, property, value.clone())?;
            self.encode(handle, value)
        };

        std::panic::catch_unwind(AssertUnwindSafe(assign))
            .unwrap_or_else(|panic| Err(CallError::new(panic_message(panic))))
            .map(|value| Some(ReplyBody::Value(value)))
            .map_err(|e| {
                e.with_frame(format!(
                    "setting property \"{}\" of instance \"{}\"",
                    property, handle.id
                ))
                .to_string()
            })
    }

    /// Invoke a callback owned by the parent and wait for its result
    async fn call_parent_callback(
        self: &Arc<Self>,
        handle: &Arc<InstanceHandle>,
        callback_id: u64,
        args: Vec<Value>,
    ) -> Result<Value, CallError> {
        let args = {
            let mut callbacks = handle.callbacks.lock();
            EncodeContext::new(self.strategy, &mut callbacks)
                .with_instance(&handle.this)
                .encode_args(args)?
        };

        let cmd_id = handle.next_cmd_id();
        let (tx, rx) = oneshot::channel();
        handle.pending.lock().insert(cmd_id, tx);

        let message = Message::Instance(InstanceMessage {
            cmd_id,
            instance_id: handle.id.to_string(),
            cmd: InstanceCommand::Callback { callback_id, args },
        });
        if let Err(e) = (self.outbound)(message) {
            handle.pending.lock().remove(&cmd_id);
            return Err(CallError::new(e.to_string()));
        }

        let reply = rx
            .await
            .map_err(|_| CallError::new("Callback aborted: instance was killed"))?;
        if let Some(error) = reply.error {
            return Err(CallError::from_remote(&error));
        }
        match reply.reply {
            Some(ReplyBody::Value(value)) => Ok(self.decoder(handle).decode(value)?),
            _ => Ok(Value::Undefined),
        }
    }

    fn decoder(self: &Arc<Self>, handle: &Arc<InstanceHandle>) -> DecodeContext<'static> {
        let this = handle.this.clone();
        let dispatcher = Arc::downgrade(self);
        let owner = Arc::downgrade(handle);
        DecodeContext::new(move |id| remote_callback(&dispatcher, &owner, id))
            .with_instance(move || Some(this.clone()))
    }

    fn encode(&self, handle: &InstanceHandle, value: Value) -> Result<ArgDefinition, CallError> {
        let mut callbacks = handle.callbacks.lock();
        EncodeContext::new(self.strategy, &mut callbacks)
            .with_instance(&handle.this)
            .encode(value)
            .map_err(CallError::from)
    }

    fn context(self: &Arc<Self>, handle: &InstanceHandle) -> CallContext {
        CallContext {
            instance_id: handle.id.clone(),
            this: handle.this.clone(),
            dispatcher: Arc::downgrade(self),
        }
    }

    fn send_to_parent(&self, handle: &InstanceHandle, cmd: InstanceCommand) {
        let name = cmd.name();
        let message = Message::Instance(InstanceMessage {
            cmd_id: handle.next_cmd_id(),
            instance_id: handle.id.to_string(),
            cmd,
        });
        if let Err(e) = (self.outbound)(message) {
            warn!("Failed to send {} for instance {}: {}", name, handle.id, e);
        }
    }

    fn reply(&self, handle: &InstanceHandle, reply_to: u64, result: Result<Option<ReplyBody>, String>) {
        let (reply, error) = match result {
            Ok(body) => (body, None),
            Err(error) => (None, Some(error)),
        };
        let message = Message::Instance(InstanceMessage {
            cmd_id: handle.next_cmd_id(),
            instance_id: handle.id.to_string(),
            cmd: InstanceCommand::Reply(Reply {
                reply_to,
                reply,
                error,
            }),
        });
        match (self.outbound)(message) {
            Ok(()) => {}
            Err(IpcError::SerializationError(e)) => {
                self.reply_with_error(
                    ReplyAddress::Instance {
                        instance_id: handle.id.to_string(),
                        reply_to,
                    },
                    format!("Unsupported attribute in reply: {}", e),
                );
            }
            Err(e) => warn!("Failed to reply to {} of {}: {}", reply_to, handle.id, e),
        }
    }

    fn reply_to_child(&self, reply_to: u64, result: Result<Option<ReplyBody>, String>) {
        let (reply, error) = match result {
            Ok(body) => (body, None),
            Err(error) => (None, Some(error)),
        };
        let message = Message::Child(ChildMessage {
            cmd_id: self.child_cmd_id.fetch_add(1, Ordering::Relaxed),
            cmd: ChildCommand::Reply(Reply {
                reply_to,
                reply,
                error,
            }),
        });
        if let Err(e) = (self.outbound)(message) {
            warn!("Failed to reply to child command {}: {}", reply_to, e);
        }
    }

    fn reply_with_error(&self, address: ReplyAddress, error: String) {
        let message = match address {
            ReplyAddress::Instance {
                instance_id,
                reply_to,
            } => {
                let cmd_id = self
                    .instances
                    .lock()
                    .get(&instance_id)
                    .map(|handle| handle.next_cmd_id())
                    .unwrap_or_default();
                Message::Instance(InstanceMessage {
                    cmd_id,
                    instance_id,
                    cmd: InstanceCommand::Reply(Reply {
                        reply_to,
                        reply: None,
                        error: Some(error),
                    }),
                })
            }
            ReplyAddress::Child { reply_to } => Message::Child(ChildMessage {
                cmd_id: self.child_cmd_id.fetch_add(1, Ordering::Relaxed),
                cmd: ChildCommand::Reply(Reply {
                    reply_to,
                    reply: None,
                    error: Some(error),
                }),
            }),
        };
        if let Err(e) = (self.outbound)(message) {
            error!("Failed to send error reply: {}", e);
        }
    }

    fn send_log(&self, level: LogLevel, log: String) {
        let message = Message::Child(ChildMessage {
            cmd_id: self.child_cmd_id.fetch_add(1, Ordering::Relaxed),
            cmd: ChildCommand::Log { level, log },
        });
        if let Err(e) = (self.outbound)(message) {
            warn!("Failed to forward log line: {}", e);
        }
    }
}

/// Redeem a callback id received from the parent
fn remote_callback(
    dispatcher: &Weak<DispatcherInner>,
    handle: &Weak<InstanceHandle>,
    callback_id: u64,
) -> Callback {
    let Some(owner) = handle.upgrade() else {
        return Callback::from_fn(move |_| {
            Err(CallError::new(format!(
                "Callback {} can no longer be called: instance is gone",
                callback_id
            )))
        });
    };

    let dispatcher = dispatcher.clone();
    let handle = handle.clone();
    owner.remote.resolve(callback_id, move |args| {
        let dispatcher = dispatcher.upgrade();
        let handle = handle.upgrade();
        async move {
            match (dispatcher, handle) {
                (Some(dispatcher), Some(handle)) => {
                    dispatcher.call_parent_callback(&handle, callback_id, args).await
                }
                _ => Err(CallError::new(format!(
                    "Callback {} can no longer be called: instance is gone",
                    callback_id
                ))),
            }
        }
        .boxed()
    })
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

/// Resident and virtual memory of this process
pub fn current_memory_usage() -> Option<MemoryUsage> {
    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|process| MemoryUsage {
        pid: pid.as_u32(),
        rss: process.memory(),
        virtual_memory: process.virtual_memory(),
    })
}
