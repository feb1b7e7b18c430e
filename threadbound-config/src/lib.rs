//! Domain-driven configuration management for threadbound
//!
//! This crate provides the per-proxy options, the runtime-wide options and
//! the logging options, with validation, defaults, and environment variable
//! support.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    logging::{LogFormat, LogLevel, LoggingConfig},
    runtime::{RuntimeConfig, ThreadMode, ThreadedClassConfig},
    ThreadboundConfig,
};

// Re-export utilities
pub use domains::utils::{serde_duration_ms, serde_duration_ms_option};
