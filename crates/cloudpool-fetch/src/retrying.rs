//! Bounded-retry pool listing.
//!
//! `RetryingFetcher` wraps the driver's list call with a fixed-delay retry
//! policy. It keeps no state between calls besides the policy itself, and
//! always contacts the driver regardless of the requested [`FetchOption`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use cloudpool_core::{Clock, CloudDriver, MachinePool, RetryPolicy};

use crate::error::{FetchError, FetchResult};
use crate::fetcher::{FetchOption, PoolFetcher};

pub struct RetryingFetcher {
    driver: Arc<dyn CloudDriver>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl RetryingFetcher {
    pub fn new(driver: Arc<dyn CloudDriver>, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            driver,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// List the pool, retrying up to `max_retries` times on failure.
    pub async fn fetch(&self) -> FetchResult<MachinePool> {
        let attempts = self.policy.max_attempts();
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.driver.list_machines().await {
                Ok(machines) => {
                    debug!(attempt, machines = machines.len(), "pool listed");
                    return Ok(MachinePool::new(machines, self.clock.now()));
                }
                Err(e) => {
                    warn!(attempt, max_attempts = attempts, error = %e, "pool listing failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.delay).await;
                    }
                }
            }
        }

        let cause = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(FetchError::unreachable(format!(
            "retry limit exceeded after {attempts} attempts: {cause}"
        )))
    }
}

#[async_trait]
impl PoolFetcher for RetryingFetcher {
    async fn get(&self, _option: FetchOption) -> FetchResult<MachinePool> {
        self.fetch().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use cloudpool_core::{InMemoryDriver, ManualClock};

    fn setup(max_retries: u32) -> (Arc<InMemoryDriver>, RetryingFetcher, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let driver = Arc::new(InMemoryDriver::with_clock(Arc::new(clock.clone())));
        let fetcher = RetryingFetcher::new(
            driver.clone(),
            RetryPolicy::new(max_retries, Duration::from_secs(5)),
            Arc::new(clock.clone()),
        );
        (driver, fetcher, clock)
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_driver_is_called_once_plus_retries() {
        let (driver, fetcher, _clock) = setup(3);
        driver.fail_lists(true);

        let err = fetcher.fetch().await.unwrap_err();
        assert_eq!(driver.list_calls(), 4);
        assert!(matches!(err, FetchError::Unreachable { .. }));
        assert!(!err.no_fetch_attempt_completed_yet());
        assert!(err.to_string().contains("after 4 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_means_single_attempt() {
        let (driver, fetcher, _clock) = setup(0);
        driver.fail_lists(true);

        assert!(fetcher.fetch().await.is_err());
        assert_eq!(driver.list_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let (driver, fetcher, clock) = setup(3);
        driver.seed_running(2);
        driver.fail_next_lists(2);
        clock.advance(Duration::from_secs(30));

        let pool = fetcher.get(FetchOption::ForceRefresh).await.unwrap();
        assert_eq!(driver.list_calls(), 3);
        assert_eq!(pool.machines.len(), 2);
        assert_eq!(pool.timestamp, clock.now());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_fixed_delay_between_attempts() {
        let (driver, fetcher, _clock) = setup(2);
        driver.fail_lists(true);

        let started = tokio::time::Instant::now();
        let _ = fetcher.fetch().await;
        // Two delays of 5s between three attempts.
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }
}
