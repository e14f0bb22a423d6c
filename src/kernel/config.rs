//! Kernel configuration
//!
//! Table sizes and buffer capacities fixed at kernel construction. Loadable
//! from JSON so test harnesses and demos can share one description.

use serde::{Deserialize, Serialize};

/// Tunables for one kernel instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Process table capacity (pids are `0..max_processes`)
    pub max_processes: usize,
    /// Descriptor slots per process
    pub max_fileid: usize,
    /// Ring buffer size of every pipe, including the two behind a socket
    pub pipe_buffer_size: usize,
    /// Highest usable port; port 0 means "no port"
    pub max_port: u16,
    /// Start with tracing enabled
    pub trace: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_processes: 1024,
            max_fileid: 16,
            pipe_buffer_size: 8192,
            max_port: 1023,
            trace: false,
        }
    }
}

/// Configuration rejected at load time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Malformed JSON
    Parse(String),
    /// A field holds an unusable value
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::Invalid(what) => write!(f, "invalid config: {}", what),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

impl KernelConfig {
    /// Parse and validate a JSON description; missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: KernelConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> String {
        // A plain struct of integers and bools always serializes
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_processes < 2 {
            return Err(ConfigError::Invalid(
                "max_processes must leave room for idle and init",
            ));
        }
        if self.max_fileid == 0 {
            return Err(ConfigError::Invalid("max_fileid must be positive"));
        }
        if self.pipe_buffer_size == 0 {
            return Err(ConfigError::Invalid("pipe_buffer_size must be positive"));
        }
        if self.max_port == 0 {
            return Err(ConfigError::Invalid("max_port must be positive"));
        }
        Ok(())
    }
}
