//! Inter-process communication for threadbound
//!
//! This crate provides the value model, argument codec, wire protocol and
//! transport abstractions shared by the parent-side manager and the workers
//! hosting proxied instances.

pub mod callbacks;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod value;

// Re-export commonly used types
pub use callbacks::{CallbackRegistry, RemoteCallbackTable};
pub use codec::{
    ArgDefinition, ArgType, DecodeContext, EncodeContext, EncodingStrategy, WireValue,
    SELF_REFERENCE,
};
pub use error::{CallError, CodecError, IpcError};
pub use protocol::{
    ChildCommand, ChildMessage, InitConfig, InitRequest, InstanceCommand, InstanceMessage,
    LogLevel, MemoryUsage, Message, MessageEnvelope, PropertyDescriptor, PropertyKind, Reply,
    ReplyBody, IPC_PROTOCOL_VERSION,
};
pub use transport::{
    decode_frame, encode_frame, ChildProcessOptions, ChildProcessTransport, SpawnedTransport,
    TransportEvent, WorkerTransport,
};
pub use value::{Callback, InstanceRef, Value, WeakCallback};
