//! Worker side of threadbound
//!
//! This crate hosts proxied instances: it keeps the registry of classes a
//! worker can construct, executes instance commands through the
//! [`Dispatcher`], and provides the three worker hosts (child process over
//! stdio, dedicated OS thread, and the caller's own runtime).

pub mod class;
pub mod dispatcher;
pub mod local;
pub mod stdio;

// Re-export commonly used types
pub use class::{
    object_of, ClassDescriptor, ClassRegistry, Constructor, InstanceCell, RegisteredClass,
    ResolveError, ThreadedObject,
};
pub use dispatcher::{current_memory_usage, CallContext, Dispatcher, Outbound, WorkerHost};
pub use local::{spawn_in_process_worker, spawn_thread_worker, ChannelTransport};
pub use stdio::{is_worker_process, run_stdio_worker, PARENT_PID_ENV_VAR, WORKER_ENV_VAR};
