//! Fetch error types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for pool fetches.
pub type FetchResult<T> = Result<T, FetchError>;

/// Conditions under which no trustworthy pool observation is available.
///
/// `Clone` so that the outcome of one in-flight fetch can be handed to every
/// caller that joined it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// No usable observation exists.
    #[error("pool unreachable: {message}")]
    Unreachable {
        /// True while the first fetch attempt is still in flight.
        no_fetch_attempt_completed_yet: bool,
        message: String,
    },

    /// The cached observation is too old to trust.
    #[error(
        "pool reachability timeout: last observation at {last_fetch} is {}s old (limit {}s)",
        .age.as_secs(),
        .timeout.as_secs()
    )]
    ReachabilityTimeout {
        last_fetch: DateTime<Utc>,
        age: Duration,
        timeout: Duration,
    },
}

impl FetchError {
    pub fn unreachable(message: impl Into<String>) -> Self {
        FetchError::Unreachable {
            no_fetch_attempt_completed_yet: false,
            message: message.into(),
        }
    }

    /// Whether the failure happened before any fetch attempt finished.
    pub fn no_fetch_attempt_completed_yet(&self) -> bool {
        matches!(
            self,
            FetchError::Unreachable {
                no_fetch_attempt_completed_yet: true,
                ..
            }
        )
    }

    pub fn is_reachability_timeout(&self) -> bool {
        matches!(self, FetchError::ReachabilityTimeout { .. })
    }
}

/// Errors reading or writing the on-disk pool snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}
