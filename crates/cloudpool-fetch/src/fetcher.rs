//! The pool fetcher abstraction shared by the retrying and caching layers.

use async_trait::async_trait;

use cloudpool_core::MachinePool;

use crate::error::FetchResult;

/// How fresh a requested observation must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOption {
    /// Serve the cached observation if it is within the reachability timeout.
    Cached,
    /// Contact the provider now, regardless of cache freshness.
    ForceRefresh,
}

/// A source of pool observations.
#[async_trait]
pub trait PoolFetcher: Send + Sync {
    async fn get(&self, option: FetchOption) -> FetchResult<MachinePool>;

    /// Note that the pool was just changed through the driver, so any
    /// observation already in progress predates the change.
    fn mark_stale(&self) {}
}
