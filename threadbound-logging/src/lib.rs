//! Logging initialisation for threadbound
//!
//! Parents configure `tracing` from [`LoggingConfig`]; worker processes log
//! to stderr only, since their stdout carries the IPC channel.

pub mod init;

pub use init::{init_logging_from_config, init_simple_tracing, init_worker_logging};
pub use threadbound_config::{LogFormat, LogLevel, LoggingConfig};
