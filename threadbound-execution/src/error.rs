//! Error types for proxied instances

use std::time::Duration;
use thiserror::Error;

use threadbound_config::ConfigError;
use threadbound_ipc::{CallError, CodecError, IpcError};

/// Result alias used throughout the crate
pub type ThreadedResult<T> = Result<T, ThreadedError>;

/// Everything that can go wrong creating or talking to a proxied instance
#[derive(Error, Debug)]
pub enum ThreadedError {
    /// Module or export is not registered
    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The constructor failed inside the worker
    #[error("Construction failed: {0}")]
    Construction(CallError),

    #[error("Restart of child {child_id} timed out after {}ms", timeout.as_millis())]
    RestartTimeout { child_id: String, timeout: Duration },

    /// A method, property access or callback failed inside the worker
    #[error("{0}")]
    Invocation(CallError),

    /// A value that cannot cross the boundary with the active encoding
    #[error("Unsupported attribute: {0}")]
    UnsupportedAttribute(String),

    #[error("Method aborted due to: {0}")]
    MethodAborted(String),

    /// The instance or its child is gone
    #[error("{0}")]
    Closed(String),

    #[error("Instance \"{0}\" is not initialized")]
    NotInitialized(String),

    #[error("Instance \"{instance_id}\" has no member \"{member}\"")]
    UnknownMember { instance_id: String, member: String },

    #[error("Failed to start worker: {0}")]
    Spawn(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ThreadedError {
    /// The call failed because the instance or its child went away
    pub fn is_closed(&self) -> bool {
        matches!(self, ThreadedError::Closed(_) | ThreadedError::MethodAborted(_))
    }

    /// The same call may succeed later, e.g. once an automatic restart completes
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ThreadedError::MethodAborted(_)
                | ThreadedError::NotInitialized(_)
                | ThreadedError::RestartTimeout { .. }
        )
    }
}

impl From<IpcError> for ThreadedError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::SerializationError(e) => ThreadedError::UnsupportedAttribute(e),
            IpcError::ConnectionClosed => {
                ThreadedError::Closed("Connection to the worker has been closed".to_string())
            }
            IpcError::SpawnFailed(e) => ThreadedError::Spawn(e),
            other => ThreadedError::Transport(other.to_string()),
        }
    }
}

impl From<CodecError> for ThreadedError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::UnsupportedAttribute(e) => ThreadedError::UnsupportedAttribute(e),
            other => ThreadedError::InvalidArgument(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ThreadedError::Closed("Child child_1 has been closed".into()).is_closed());
        assert!(ThreadedError::MethodAborted("crash".into()).is_closed());
        assert!(ThreadedError::MethodAborted("crash".into()).is_retryable());
        assert!(!ThreadedError::Invocation(CallError::new("boom")).is_retryable());
    }

    #[test]
    fn test_ipc_errors_map_onto_taxonomy() {
        let err: ThreadedError = IpcError::SerializationError("circular".into()).into();
        assert!(matches!(err, ThreadedError::UnsupportedAttribute(_)));

        let err: ThreadedError = IpcError::ConnectionClosed.into();
        assert!(err.is_closed());
        assert!(err.to_string().contains("closed"));

        let err: ThreadedError = CodecError::UnsupportedAttribute("function in array".into()).into();
        assert!(err.to_string().starts_with("Unsupported attribute"));
    }

    #[test]
    fn test_display() {
        let err = ThreadedError::MethodAborted("child crashed".into());
        assert_eq!(err.to_string(), "Method aborted due to: child crashed");

        let err = ThreadedError::RestartTimeout {
            child_id: "child_0".into(),
            timeout: Duration::from_millis(1000),
        };
        assert_eq!(err.to_string(), "Restart of child child_0 timed out after 1000ms");
    }
}
