//! Configuration loading and environment variable handling

use crate::domains::ThreadboundConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "THREADBOUND".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML or JSON file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<ThreadboundConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config: ThreadboundConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config)?;

        // Validate all domains
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<ThreadboundConfig> {
        let mut config = ThreadboundConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<ThreadboundConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut ThreadboundConfig) -> ConfigResult<()> {
        self.apply_runtime_overrides(&mut config.runtime)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply runtime config overrides
    fn apply_runtime_overrides(
        &self,
        config: &mut crate::domains::runtime::RuntimeConfig,
    ) -> ConfigResult<()> {
        if let Ok(mode) = self.get_env_var("THREAD_MODE") {
            config.thread_mode = crate::domains::runtime::ThreadMode::from_str(&mode)
                .map_err(|_| ConfigError::EnvError(format!("Invalid THREAD_MODE: {}", mode)))?;
        }

        if let Ok(path) = self.get_env_var("WORKER_PATH") {
            config.worker_path = Some(path.into());
        }

        if let Ok(strict) = self.get_env_var("STRICT") {
            config.strict = strict
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid STRICT: {}", e)))?;
        }

        if let Ok(handle) = self.get_env_var("HANDLE_EXIT_SIGNALS") {
            config.handle_exit_signals = handle.parse().map_err(|e| {
                ConfigError::EnvError(format!("Invalid HANDLE_EXIT_SIGNALS: {}", e))
            })?;
        }

        let defaults = &mut config.defaults;

        if let Ok(auto_restart) = self.get_env_var("AUTO_RESTART") {
            defaults.auto_restart = auto_restart
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid AUTO_RESTART: {}", e)))?;
        }

        if let Some(timeout) = self.get_millis("RESTART_TIMEOUT_MS")? {
            defaults.restart_timeout = timeout;
        }

        if let Some(timeout) = self.get_millis("KILL_TIMEOUT_MS")? {
            defaults.kill_timeout = timeout;
        }

        // Zero turns liveness checks off
        if let Some(limit) = self.get_millis("FREEZE_LIMIT_MS")? {
            defaults.freeze_limit = (!limit.is_zero()).then_some(limit);
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(
        &self,
        config: &mut crate::domains::logging::LoggingConfig,
    ) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = crate::domains::logging::LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = crate::domains::logging::LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    fn get_millis(&self, name: &str) -> ConfigResult<Option<Duration>> {
        match self.get_env_var(name) {
            Ok(value) => {
                let millis: u64 = value
                    .parse()
                    .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e)))?;
                Ok(Some(Duration::from_millis(millis)))
            }
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
