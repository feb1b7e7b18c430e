//! IPC protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::ArgDefinition;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Every message exchanged between a parent and a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "lowercase")]
pub enum Message {
    /// Addressed to (or coming from) a single proxied instance
    Instance(InstanceMessage),
    /// Addressed to (or coming from) the worker as a whole
    Child(ChildMessage),
}

impl Message {
    pub fn cmd_id(&self) -> u64 {
        match self {
            Message::Instance(msg) => msg.cmd_id,
            Message::Child(msg) => msg.cmd_id,
        }
    }

    /// Whether the sender waits for a reply to this message
    pub fn expects_reply(&self) -> bool {
        match self {
            Message::Instance(msg) => !matches!(
                msg.cmd,
                InstanceCommand::Reply(_) | InstanceCommand::ReleaseCallback { .. }
            ),
            Message::Child(msg) => matches!(msg.cmd, ChildCommand::GetMemUsage),
        }
    }

    /// Build the reply message answering this one
    pub fn reply(&self, cmd_id: u64, body: Option<ReplyBody>, error: Option<String>) -> Message {
        let reply = Reply {
            reply_to: self.cmd_id(),
            reply: body,
            error,
        };
        match self {
            Message::Instance(msg) => Message::Instance(InstanceMessage {
                cmd_id,
                instance_id: msg.instance_id.clone(),
                cmd: InstanceCommand::Reply(reply),
            }),
            Message::Child(_) => Message::Child(ChildMessage {
                cmd_id,
                cmd: ChildCommand::Reply(reply),
            }),
        }
    }

    /// Short name of the command, for logs
    pub fn command_name(&self) -> &'static str {
        match self {
            Message::Instance(msg) => msg.cmd.name(),
            Message::Child(msg) => msg.cmd.name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMessage {
    pub cmd_id: u64,
    pub instance_id: String,
    #[serde(flatten)]
    pub cmd: InstanceCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildMessage {
    pub cmd_id: u64,
    #[serde(flatten)]
    pub cmd: ChildCommand,
}

/// Commands understood by a single instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceCommand {
    /// Construct the instance
    Init(InitRequest),
    /// Liveness check
    Ping,
    /// Invoke a method (or read a property)
    Function {
        fcn: String,
        args: Vec<ArgDefinition>,
    },
    /// Assign a property
    Set {
        property: String,
        value: ArgDefinition,
    },
    /// Drop the instance
    Kill,
    /// Invoke a callback previously exported by the receiver
    #[serde(rename_all = "camelCase")]
    Callback {
        callback_id: u64,
        args: Vec<ArgDefinition>,
    },
    /// The sender dropped every handle it held for a callback
    #[serde(rename_all = "camelCase")]
    ReleaseCallback { callback_id: u64, count: u64 },
    Reply(Reply),
}

impl InstanceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            InstanceCommand::Init(_) => "INIT",
            InstanceCommand::Ping => "PING",
            InstanceCommand::Function { .. } => "FUNCTION",
            InstanceCommand::Set { .. } => "SET",
            InstanceCommand::Kill => "KILL",
            InstanceCommand::Callback { .. } => "CALLBACK",
            InstanceCommand::ReleaseCallback { .. } => "RELEASE_CALLBACK",
            InstanceCommand::Reply(_) => "REPLY",
        }
    }
}

/// Commands understood by the worker as a whole
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChildCommand {
    GetMemUsage,
    /// Log line forwarded from the worker
    Log { level: LogLevel, log: String },
    Reply(Reply),
}

impl ChildCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ChildCommand::GetMemUsage => "GET_MEM_USAGE",
            ChildCommand::Log { .. } => "LOG",
            ChildCommand::Reply(_) => "REPLY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub module_path: String,
    pub export_name: String,
    pub args: Vec<ArgDefinition>,
    pub config: InitConfig,
    pub parent_pid: u32,
}

/// The part of the proxy configuration a worker needs to know
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub reply_to: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplyBody {
    /// Manifest of the constructed instance
    Props(Vec<PropertyDescriptor>),
    Value(ArgDefinition),
    MemoryUsage(MemoryUsage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    Function,
    Value,
}

/// One entry of the property manifest returned by INIT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: PropertyKind,
    pub enumerable: bool,
    /// Backed by a getter
    pub get: bool,
    /// Backed by a setter
    pub set: bool,
    pub writable: bool,
    /// Plain data, neither getter nor setter
    pub readable: bool,
}

impl PropertyDescriptor {
    pub fn is_function(&self) -> bool {
        self.kind == PropertyKind::Function
    }

    pub fn can_read(&self) -> bool {
        self.readable || self.get
    }

    pub fn can_write(&self) -> bool {
        self.writable || self.set
    }
}

/// Memory statistics of a worker process, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub pid: u32,
    pub rss: u64,
    pub virtual_memory: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}
