//! IPC error types

use std::fmt;
use thiserror::Error;

/// IPC error types
#[derive(Debug, Error)]
pub enum IpcError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    /// Worker could not be started
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),
}

impl IpcError {
    /// The peer speaks a different protocol, so no later frame can be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(self, IpcError::ProtocolVersionMismatch { .. })
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::IoError(err.to_string())
        } else if err.is_data() {
            IpcError::DeserializationError(err.to_string())
        } else {
            IpcError::SerializationError(err.to_string())
        }
    }
}

/// Errors raised while tagging or untagging arguments
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The value cannot be represented under the active encoding strategy
    #[error("Unsupported attribute: {0}")]
    UnsupportedAttribute(String),

    /// A buffer payload was not valid base64
    #[error("Invalid buffer payload: {0}")]
    InvalidBuffer(String),

    /// The argument definition does not match its declared type
    #[error("Malformed argument: {0}")]
    MalformedArgument(String),

    /// A self reference arrived but no instance is available to resolve it
    #[error("Self reference could not be resolved: no instance available")]
    MissingInstance,
}

const FRAME_SEPARATOR: &str = "\n    at ";

/// Failure of a call made through a proxy, a callback or a worker method.
///
/// The message is whatever the failing side reported; frames are appended as
/// the error travels back towards the caller, so the rendered form reads from
/// the remote origin down to the local call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    message: String,
    frames: Vec<String>,
}

impl CallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            frames: Vec::new(),
        }
    }

    /// Rebuild an error from its rendered form as received over the wire
    pub fn from_remote(rendered: &str) -> Self {
        let mut parts = rendered.split(FRAME_SEPARATOR);
        let message = parts.next().unwrap_or_default().to_string();
        Self {
            message,
            frames: parts.map(str::to_string).collect(),
        }
    }

    /// Append a context frame
    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.frames.push(frame.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.frames {
            write!(f, "{}{}", FRAME_SEPARATOR, frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for CallError {}

impl From<String> for CallError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for CallError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<CodecError> for CallError {
    fn from(err: CodecError) -> Self {
        Self::new(err.to_string())
    }
}
