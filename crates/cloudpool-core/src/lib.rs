//! cloudpool-core — shared vocabulary of the pool reconciliation engine.
//!
//! - [`types`]: machines, pool snapshots, and pool-size summaries
//! - [`driver`]: the cloud driver boundary ([`CloudDriver`])
//! - [`alert`]: alert model and sinks
//! - [`clock`]: injectable wall clock
//! - [`config`]: TOML pool configuration
//! - [`memory`]: an in-process driver for simulation and tests

pub mod alert;
pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod memory;
pub mod types;

pub use alert::{Alert, AlertSeverity, AlertSink, AlertTopic, LogAlertSink, MemoryAlertSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PoolConfig, RetryPolicy, VictimSelectionPolicy};
pub use driver::CloudDriver;
pub use error::{ConfigError, ConfigResult, DriverError, DriverResult, StartMachinesError};
pub use memory::InMemoryDriver;
pub use types::*;
