//! Runtime and per-proxy configuration

use crate::error::ConfigResult;
use crate::validation::{
    validate_fraction, validate_positive_duration, validate_required_string, Validatable,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How workers are hosted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThreadMode {
    /// A separate OS process per child, talking JSON lines over stdio
    ChildProcess,
    /// A dedicated OS thread per child inside this process
    #[default]
    WorkerThreads,
    /// No isolation: instances run on the caller's runtime
    InProcess,
}

impl fmt::Display for ThreadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreadMode::ChildProcess => "child_process",
            ThreadMode::WorkerThreads => "worker_threads",
            ThreadMode::InProcess => "in_process",
        };
        f.write_str(name)
    }
}

impl FromStr for ThreadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "child_process" | "process" => Ok(ThreadMode::ChildProcess),
            "worker_threads" | "thread" | "threads" => Ok(ThreadMode::WorkerThreads),
            "in_process" | "disabled" => Ok(ThreadMode::InProcess),
            _ => Err(format!("Invalid thread mode: {}", s)),
        }
    }
}

/// Options accepted when creating a proxied instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadedClassConfig {
    /// Share of a child this instance needs; unset means a child of its own
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_usage: Option<f64>,

    /// Pin the instance to the child with this id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    /// Restart the child and re-create the instance after a crash
    pub auto_restart: bool,

    /// How long a restart may take
    #[serde(with = "crate::domains::utils::serde_duration_ms")]
    pub restart_timeout: Duration,

    /// How long to wait for a worker to acknowledge a kill
    #[serde(with = "crate::domains::utils::serde_duration_ms")]
    pub kill_timeout: Duration,

    /// Run the instance on the caller's runtime instead of a worker
    pub disable_multithreading: bool,

    /// Worker executable for child-process mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_to_worker: Option<PathBuf>,

    /// Ping interval and reply deadline; `None` disables liveness checks
    #[serde(with = "crate::domains::utils::serde_duration_ms_option")]
    pub freeze_limit: Option<Duration>,

    /// Name used in logs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
}

pub const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_FREEZE_LIMIT: Duration = Duration::from_millis(1000);

impl Default for ThreadedClassConfig {
    fn default() -> Self {
        Self {
            thread_usage: None,
            thread_id: None,
            auto_restart: false,
            restart_timeout: DEFAULT_RESTART_TIMEOUT,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            disable_multithreading: false,
            path_to_worker: None,
            freeze_limit: Some(DEFAULT_FREEZE_LIMIT),
            instance_name: None,
        }
    }
}

impl ThreadedClassConfig {
    pub fn with_thread_usage(mut self, usage: f64) -> Self {
        self.thread_usage = Some(usage);
        self
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = auto_restart;
        self
    }

    pub fn with_restart_timeout(mut self, timeout: Duration) -> Self {
        self.restart_timeout = timeout;
        self
    }

    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    pub fn with_disable_multithreading(mut self, disable: bool) -> Self {
        self.disable_multithreading = disable;
        self
    }

    pub fn with_path_to_worker(mut self, path: impl Into<PathBuf>) -> Self {
        self.path_to_worker = Some(path.into());
        self
    }

    pub fn with_freeze_limit(mut self, limit: Option<Duration>) -> Self {
        self.freeze_limit = limit;
        self
    }

    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = Some(name.into());
        self
    }
}

impl Validatable for ThreadedClassConfig {
    fn validate(&self) -> ConfigResult<()> {
        let domain = self.domain_name();
        if let Some(usage) = self.thread_usage {
            validate_fraction(usage, "thread_usage", domain)?;
        }
        if let Some(thread_id) = &self.thread_id {
            validate_required_string(thread_id, "thread_id", domain)?;
        }
        if self.thread_id.is_some() && self.disable_multithreading {
            return Err(self.validation_error(
                "thread_id cannot be combined with disable_multithreading",
            ));
        }
        validate_positive_duration(self.restart_timeout, "restart_timeout", domain)?;
        validate_positive_duration(self.kill_timeout, "kill_timeout", domain)?;
        if let Some(limit) = self.freeze_limit {
            validate_positive_duration(limit, "freeze_limit", domain)?;
        }
        if let Some(path) = &self.path_to_worker {
            if path.as_os_str().is_empty() {
                return Err(self.validation_error("path_to_worker cannot be empty"));
            }
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "runtime.defaults"
    }
}

/// Runtime-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// How workers are hosted when an instance does not disable multithreading
    pub thread_mode: ThreadMode,

    /// Worker executable for child-process mode; defaults to the current executable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_path: Option<PathBuf>,

    /// Warn when lifecycle events fire without listeners
    #[serde(default = "crate::domains::utils::default_false")]
    pub strict: bool,

    /// Kill all children and exit on termination signals
    #[serde(default = "crate::domains::utils::default_true")]
    pub handle_exit_signals: bool,

    /// Options applied to every proxy unless overridden
    #[serde(default)]
    pub defaults: ThreadedClassConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_mode: ThreadMode::default(),
            worker_path: None,
            strict: false,
            handle_exit_signals: true,
            defaults: ThreadedClassConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_thread_mode(mut self, mode: ThreadMode) -> Self {
        self.thread_mode = mode;
        self
    }

    pub fn with_worker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_path = Some(path.into());
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_handle_exit_signals(mut self, handle: bool) -> Self {
        self.handle_exit_signals = handle;
        self
    }
}

impl Validatable for RuntimeConfig {
    fn validate(&self) -> ConfigResult<()> {
        if let Some(path) = &self.worker_path {
            if path.as_os_str().is_empty() {
                return Err(self.validation_error("worker_path cannot be empty"));
            }
        }
        self.defaults.validate()
    }

    fn domain_name(&self) -> &'static str {
        "runtime"
    }
}
