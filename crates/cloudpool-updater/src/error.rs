//! Updater error types.

use thiserror::Error;

use cloudpool_core::{DriverError, StartMachinesError};
use cloudpool_fetch::FetchError;

/// Errors raised by pool updates and manual pool mutations.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("pool fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("driver call failed: {0}")]
    Driver(#[from] DriverError),

    #[error("scale-out incomplete: {0}")]
    PartialStart(#[from] StartMachinesError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type UpdateResult<T> = Result<T, UpdateError>;
