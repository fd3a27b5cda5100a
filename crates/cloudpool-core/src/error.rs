//! Error types shared across the cloudpool crates.

use thiserror::Error;

use crate::types::{Machine, MachineId};

/// Result type alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors reported by a cloud driver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("machine not found: {0}")]
    NotFound(MachineId),

    #[error("cloud api call failed: {0}")]
    Api(String),
}

/// A scale-out that stopped partway.
///
/// Carries the machines that did start so that callers can account for
/// launched resources even though the request as a whole failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("started {} of {requested} requested machines: {cause}", .started.len())]
pub struct StartMachinesError {
    pub requested: usize,
    pub started: Vec<Machine>,
    pub cause: String,
}

impl StartMachinesError {
    pub fn new(requested: usize, started: Vec<Machine>, cause: impl Into<String>) -> Self {
        Self {
            requested,
            started,
            cause: cause.into(),
        }
    }

    pub fn started_ids(&self) -> Vec<MachineId> {
        self.started.iter().map(|m| m.id.clone()).collect()
    }
}

/// Result type alias for configuration handling.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while reading or validating a pool configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration {value:?} for {field}")]
    Duration { field: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}
