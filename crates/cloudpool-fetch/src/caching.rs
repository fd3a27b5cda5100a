//! Cached, persisted, staleness-aware pool view.
//!
//! `CachingFetcher` wraps a delegate fetcher (normally a
//! [`RetryingFetcher`](crate::RetryingFetcher)) and owns:
//!
//! - a single in-memory cache slot holding the last successful observation
//! - an optional on-disk mirror of that slot, restored on construction
//! - a background task that force-refreshes the slot on a fixed interval
//!
//! ```text
//! get(Cached)        ──► cache slot ──(age > reachability_timeout)──► ReachabilityTimeout
//!                                   └─(empty)────────────────────────► Unreachable
//! get(ForceRefresh)  ──► single-flight delegate fetch ──► cache slot + snapshot file
//! refresh loop       ──► get(ForceRefresh) every refresh_interval
//! ```
//!
//! At most one delegate fetch is in flight at a time. A forced refresh that
//! arrives while another is running waits for it and returns its outcome
//! instead of issuing a second driver call, unless the pool was marked stale
//! after that fetch began. A listing taken before a scale-out landed must not
//! be handed to a caller that already knows about the scale-out.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cloudpool_core::clock::elapsed_between;
use cloudpool_core::{Alert, AlertSeverity, AlertSink, AlertTopic, Clock, MachinePool};

use crate::error::{FetchError, FetchResult};
use crate::fetcher::{FetchOption, PoolFetcher};
use crate::snapshot::{CacheEntry, SnapshotFile};

/// Timing and persistence settings for a [`CachingFetcher`].
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Interval between background refreshes.
    pub refresh_interval: Duration,
    /// Maximum age of a cached observation before it is untrustworthy.
    pub reachability_timeout: Duration,
    /// Where to mirror the cache slot, if anywhere.
    pub snapshot_path: Option<PathBuf>,
}

impl CacheSettings {
    pub fn new(refresh_interval: Duration, reachability_timeout: Duration) -> Self {
        Self {
            refresh_interval,
            reachability_timeout,
            snapshot_path: None,
        }
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }
}

/// Handle to the background refresh task.
struct RefreshTask {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

struct Inner {
    delegate: Arc<dyn PoolFetcher>,
    settings: CacheSettings,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
    snapshot: Option<SnapshotFile>,
    cache: RwLock<Option<CacheEntry>>,
    /// Held for the duration of a delegate fetch.
    fetch_lock: tokio::sync::Mutex<()>,
    /// Bumped every time a delegate fetch completes.
    generation: AtomicU64,
    /// Bumped by `mark_stale` whenever the pool is mutated.
    epoch: AtomicU64,
    /// Epoch at which the last completed delegate fetch started.
    last_fetch_epoch: AtomicU64,
    last_outcome: Mutex<Option<FetchResult<MachinePool>>>,
    /// Flips to `true` once the first fetch attempt has completed.
    first_fetch: watch::Sender<bool>,
}

pub struct CachingFetcher {
    inner: Arc<Inner>,
    task: Mutex<Option<RefreshTask>>,
}

impl CachingFetcher {
    /// Create a caching fetcher. If a snapshot path is configured and a
    /// snapshot exists, it is loaded into the cache before any fetch happens.
    ///
    /// The background refresh loop is not running until [`start`](Self::start).
    pub fn new(
        delegate: Arc<dyn PoolFetcher>,
        settings: CacheSettings,
        clock: Arc<dyn Clock>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let snapshot = settings.snapshot_path.clone().map(SnapshotFile::new);
        let restored = snapshot.as_ref().and_then(|file| match file.load() {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = ?file.path(), error = %e, "ignoring unreadable pool snapshot");
                None
            }
        });
        if let Some(entry) = &restored {
            info!(
                fetch_time = %entry.fetch_time,
                machines = entry.pool.machines.len(),
                "restored pool snapshot"
            );
        }

        let (first_fetch, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                delegate,
                settings,
                clock,
                alerts,
                snapshot,
                cache: RwLock::new(restored),
                fetch_lock: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                last_fetch_epoch: AtomicU64::new(0),
                last_outcome: Mutex::new(None),
                first_fetch,
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the background refresh loop. Calling it again while the loop is
    /// running has no effect.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            run_refresh_loop(inner, shutdown_rx).await;
        });
        *task = Some(RefreshTask {
            handle,
            shutdown_tx,
        });
        info!(
            interval_secs = self.inner.settings.refresh_interval.as_secs(),
            "pool refresh loop started"
        );
    }

    /// Stop scheduling refreshes. An in-flight fetch runs to completion.
    pub fn close(&self) {
        if let Some(task) = self.task.lock().take() {
            let _ = task.shutdown_tx.send(true);
            drop(task.handle);
            info!("pool refresh loop stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Wait until the first fetch attempt (scheduled or forced) has
    /// completed, whether it succeeded or not.
    pub async fn await_first_fetch(&self) {
        let mut rx = self.inner.first_fetch.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

}

impl Drop for CachingFetcher {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl PoolFetcher for CachingFetcher {
    async fn get(&self, option: FetchOption) -> FetchResult<MachinePool> {
        match option {
            FetchOption::Cached => self.inner.cached(),
            FetchOption::ForceRefresh => self.inner.refresh().await,
        }
    }

    /// Forced refreshes requested from now on will not join a delegate fetch
    /// that is already running.
    fn mark_stale(&self) {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(epoch, "pool marked stale");
    }
}

impl Inner {
    fn cached(&self) -> FetchResult<MachinePool> {
        let cache = self.cache.read();
        match cache.as_ref() {
            Some(entry) => {
                let age = elapsed_between(entry.fetch_time, self.clock.now());
                if age > self.settings.reachability_timeout {
                    return Err(FetchError::ReachabilityTimeout {
                        last_fetch: entry.fetch_time,
                        age,
                        timeout: self.settings.reachability_timeout,
                    });
                }
                Ok(entry.pool.clone())
            }
            None => {
                let completed = *self.first_fetch.borrow();
                let message = if completed {
                    match self.last_outcome.lock().as_ref() {
                        Some(Err(e)) => format!("no successful pool fetch yet: {e}"),
                        _ => "no successful pool fetch yet".to_string(),
                    }
                } else {
                    "no pool fetch attempt has completed yet".to_string()
                };
                Err(FetchError::Unreachable {
                    no_fetch_attempt_completed_yet: !completed,
                    message,
                })
            }
        }
    }

    async fn refresh(&self) -> FetchResult<MachinePool> {
        let seen = self.generation.load(Ordering::SeqCst);
        let required_epoch = self.epoch.load(Ordering::SeqCst);
        let _guard = self.fetch_lock.lock().await;

        if self.generation.load(Ordering::SeqCst) != seen
            && self.last_fetch_epoch.load(Ordering::SeqCst) >= required_epoch
            && let Some(outcome) = self.last_outcome.lock().clone()
        {
            debug!("joined in-flight pool fetch");
            return outcome;
        }

        let started_epoch = self.epoch.load(Ordering::SeqCst);
        let outcome = self.delegate.get(FetchOption::ForceRefresh).await;
        match &outcome {
            Ok(pool) => self.store(pool),
            Err(e) => {
                warn!(error = %e, "pool fetch failed");
                self.alerts.publish(
                    Alert::new(
                        AlertTopic::PoolFetch,
                        AlertSeverity::Warn,
                        self.clock.now(),
                        "failed to fetch machine pool",
                    )
                    .with_details(e.to_string()),
                );
            }
        }

        *self.last_outcome.lock() = Some(outcome.clone());
        self.last_fetch_epoch.store(started_epoch, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.first_fetch.send_replace(true);
        outcome
    }

    fn store(&self, pool: &MachinePool) {
        let entry = CacheEntry::new(pool.clone(), self.clock.now());
        if let Some(file) = &self.snapshot
            && let Err(e) = file.save(&entry)
        {
            warn!(path = ?file.path(), error = %e, "failed to persist pool snapshot");
        }
        debug!(machines = pool.machines.len(), "pool cache updated");
        *self.cache.write() = Some(entry);
    }
}

/// Refresh immediately, then once per interval until shut down.
async fn run_refresh_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if let Err(e) = inner.refresh().await {
            debug!(error = %e, "scheduled pool refresh failed");
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.settings.refresh_interval) => {}
            _ = shutdown.changed() => {
                debug!("pool refresh loop shutting down");
                break;
            }
        }
    }
}
