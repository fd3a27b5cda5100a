//! cloudpool-fetch — a trustworthy, rate-limited view of the pool.
//!
//! Two layers sit between the reconciliation engine and the cloud driver:
//!
//! ```text
//! PoolUpdater ──► CachingFetcher ──► RetryingFetcher ──► CloudDriver::list_machines
//!                   ├── cache slot (age checked against reachability_timeout)
//!                   ├── SnapshotFile (restored on startup)
//!                   └── refresh loop (every refresh_interval)
//! ```
//!
//! Transient driver errors are retried inside `RetryingFetcher` and never
//! surface as retryable; callers see either a pool snapshot or a
//! [`FetchError`].

pub mod caching;
pub mod error;
pub mod fetcher;
pub mod retrying;
pub mod snapshot;

pub use caching::{CacheSettings, CachingFetcher};
pub use error::{FetchError, FetchResult, SnapshotError};
pub use fetcher::{FetchOption, PoolFetcher};
pub use retrying::RetryingFetcher;
pub use snapshot::{CacheEntry, SnapshotFile};
