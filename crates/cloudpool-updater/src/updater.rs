//! Pool reconciliation.
//!
//! ```text
//! tick ──► try_resize
//!           ├── fetch pool (ForceRefresh)
//!           ├── purge queue entries for machines that are gone
//!           ├── determine desired size (first time only)
//!           ├── plan
//!           ├── spare queued terminations / start machines
//!           ├── queue new terminations
//!           └── terminate overdue entries
//! ```
//!
//! Two locks guard the updater. `desired_size` has its own short-lived lock
//! so reads never wait on a slow resize. The update lock owns the
//! termination queue and serializes resizes with manual pool mutations.
//!
//! Every driver call that changes the pool marks the fetcher stale, so the
//! next resize plans from a listing taken after the change.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cloudpool_core::{
    AlertSink, Clock, CloudDriver, Machine, MachinePool, MembershipStatus, PoolSizeSummary,
    ServiceState,
};
use cloudpool_fetch::{FetchOption, PoolFetcher};
use cloudpool_planner::{ResizePlan, ResizePlanner, ScheduledTermination, TerminationQueue};

use crate::alerts;
use crate::error::{UpdateError, UpdateResult};

/// Outcome of one successful reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeReport {
    pub desired_size: usize,
    pub plan: ResizePlan,
    pub started: Vec<Machine>,
    pub terminated: Vec<Machine>,
}

struct ResizeTask {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

struct Inner {
    driver: Arc<dyn CloudDriver>,
    fetcher: Arc<dyn PoolFetcher>,
    planner: ResizePlanner,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    desired_size: Mutex<Option<usize>>,
    /// Pool-update lock. Every resize and manual mutation holds it.
    queue: tokio::sync::Mutex<TerminationQueue>,
}

/// Keeps the pool at its desired size.
pub struct PoolUpdater {
    inner: Arc<Inner>,
    task: Mutex<Option<ResizeTask>>,
}

impl PoolUpdater {
    pub fn new(
        driver: Arc<dyn CloudDriver>,
        fetcher: Arc<dyn PoolFetcher>,
        planner: ResizePlanner,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver,
                fetcher,
                planner,
                alerts,
                clock,
                desired_size: Mutex::new(None),
                queue: tokio::sync::Mutex::new(TerminationQueue::new()),
            }),
            task: Mutex::new(None),
        }
    }

    // ── Desired size ─────────────────────────────────────────────────

    /// Set the desired size. Negative sizes are rejected.
    pub fn set_desired_size(&self, size: i64) -> UpdateResult<()> {
        let size = usize::try_from(size).map_err(|_| {
            UpdateError::InvalidArgument(format!("desired size must be non-negative, got {size}"))
        })?;
        let previous = self.inner.desired_size.lock().replace(size);
        if previous != Some(size) {
            info!(desired_size = size, ?previous, "desired size changed");
            self.inner
                .alerts
                .publish(alerts::desired_size_changed(self.inner.clock.now(), previous, size));
        }
        Ok(())
    }

    /// The desired size. If it was never set, it is derived once from the
    /// number of active machines in a fresh pool listing. Never waits for
    /// the update lock.
    pub async fn desired_size(&self) -> UpdateResult<usize> {
        self.inner.ensure_desired_size().await
    }

    // ── Reconciliation ───────────────────────────────────────────────

    /// Run one reconciliation, reporting any failure to the caller.
    pub async fn try_resize(&self) -> UpdateResult<ResizeReport> {
        self.inner.try_resize().await
    }

    /// Run one reconciliation. Failures are logged and alerted, never
    /// returned.
    pub async fn resize(&self) {
        self.inner.resize().await;
    }

    /// Spawn the periodic resize loop. Has no effect if already running.
    pub fn start(&self, interval: Duration) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            run_resize_loop(inner, interval, shutdown_rx).await;
        });
        *task = Some(ResizeTask {
            handle,
            shutdown_tx,
        });
    }

    /// Stop the resize loop. A resize in progress runs to completion.
    pub fn close(&self) {
        if let Some(task) = self.task.lock().take() {
            let _ = task.shutdown_tx.send(true);
            drop(task.handle);
            info!("pool updater stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    // ── Pool mutations ───────────────────────────────────────────────

    /// Terminate a pool member. With `decrement_desired_size` the desired
    /// size shrinks by one (never below zero), otherwise the machine will be
    /// replaced on the next resize.
    pub async fn terminate_machine(
        &self,
        machine_id: &str,
        decrement_desired_size: bool,
    ) -> UpdateResult<()> {
        let mut queue = self.inner.queue.lock().await;
        self.inner.ensure_desired_size().await?;

        let result = self.inner.driver.terminate_machine(machine_id).await;
        self.inner.fetcher.mark_stale();
        result?;
        queue.remove(machine_id);
        if decrement_desired_size {
            self.inner.decrement_desired_size();
        }

        info!(machine_id, decrement_desired_size, "machine terminated");
        self.inner
            .alerts
            .publish(alerts::machine_terminated(self.inner.clock.now(), machine_id));
        Ok(())
    }

    /// Attach a machine to the pool and grow the desired size by one.
    pub async fn attach_machine(&self, machine_id: &str) -> UpdateResult<()> {
        let _update = self.inner.queue.lock().await;
        self.inner.ensure_desired_size().await?;

        let result = self.inner.driver.attach_machine(machine_id).await;
        self.inner.fetcher.mark_stale();
        result?;
        {
            let mut desired = self.inner.desired_size.lock();
            *desired = desired.map(|d| d + 1);
        }

        info!(machine_id, "machine attached");
        self.inner
            .alerts
            .publish(alerts::machine_attached(self.inner.clock.now(), machine_id));
        Ok(())
    }

    /// Detach a machine from the pool without terminating it.
    pub async fn detach_machine(
        &self,
        machine_id: &str,
        decrement_desired_size: bool,
    ) -> UpdateResult<()> {
        let mut queue = self.inner.queue.lock().await;
        self.inner.ensure_desired_size().await?;

        let result = self.inner.driver.detach_machine(machine_id).await;
        self.inner.fetcher.mark_stale();
        result?;
        queue.remove(machine_id);
        if decrement_desired_size {
            self.inner.decrement_desired_size();
        }

        info!(machine_id, decrement_desired_size, "machine detached");
        self.inner
            .alerts
            .publish(alerts::machine_detached(self.inner.clock.now(), machine_id));
        Ok(())
    }

    /// Forward a service-state change to the driver.
    pub async fn set_service_state(&self, machine_id: &str, state: ServiceState) -> UpdateResult<()> {
        self.inner.driver.set_service_state(machine_id, state).await?;
        debug!(machine_id, %state, "service state set");
        self.inner.alerts.publish(alerts::service_state_changed(
            self.inner.clock.now(),
            machine_id,
            state,
        ));
        Ok(())
    }

    pub async fn set_membership_status(
        &self,
        machine_id: &str,
        status: MembershipStatus,
    ) -> UpdateResult<()> {
        let result = self
            .inner
            .driver
            .set_membership_status(machine_id, status)
            .await;
        self.inner.fetcher.mark_stale();
        result?;
        info!(machine_id, %status, "membership status set");
        self.inner.alerts.publish(alerts::membership_status_changed(
            self.inner.clock.now(),
            machine_id,
            status,
        ));
        Ok(())
    }

    // ── Read model ───────────────────────────────────────────────────

    /// The last cached pool observation.
    pub async fn pool(&self) -> UpdateResult<MachinePool> {
        Ok(self.inner.fetcher.get(FetchOption::Cached).await?)
    }

    pub async fn pool_size(&self) -> UpdateResult<PoolSizeSummary> {
        let pool = self.pool().await?;
        let desired_size = self.desired_size().await?;
        Ok(PoolSizeSummary {
            timestamp: pool.timestamp,
            desired_size,
            allocated: pool.allocated_count(),
            active: pool.active_count(),
        })
    }

    /// Terminations waiting for their deadline, soonest first.
    pub async fn scheduled_terminations(&self) -> Vec<ScheduledTermination> {
        self.inner.queue.lock().await.entries()
    }
}

impl Drop for PoolUpdater {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    /// Desired size, determined from a forced fetch if never set.
    async fn ensure_desired_size(&self) -> UpdateResult<usize> {
        if let Some(size) = *self.desired_size.lock() {
            return Ok(size);
        }
        let pool = self.fetcher.get(FetchOption::ForceRefresh).await?;
        // Nothing is queued before the desired size is first set.
        Ok(self.init_desired_size(&pool, &TerminationQueue::new()))
    }

    /// Set the desired size from `pool` unless it is already set.
    fn init_desired_size(&self, pool: &MachinePool, queue: &TerminationQueue) -> usize {
        let mut desired = self.desired_size.lock();
        if let Some(size) = *desired {
            return size;
        }
        let size = ResizePlanner::net_size(pool, queue);
        info!(desired_size = size, "desired size initialized from pool");
        *desired = Some(size);
        size
    }

    fn decrement_desired_size(&self) {
        let mut desired = self.desired_size.lock();
        *desired = desired.map(|d| d.saturating_sub(1));
    }

    async fn resize(&self) {
        match self.try_resize().await {
            Ok(report) => {
                debug!(
                    desired_size = report.desired_size,
                    started = report.started.len(),
                    terminated = report.terminated.len(),
                    "pool resize complete"
                );
            }
            Err(UpdateError::PartialStart(e)) => {
                // Already alerted with the machines that did start.
                warn!(error = %e, "pool resize incomplete");
            }
            Err(e) => {
                error!(error = %e, "pool resize failed");
                self.alerts
                    .publish(alerts::resize_failed(self.clock.now(), &e.to_string()));
            }
        }
    }

    async fn try_resize(&self) -> UpdateResult<ResizeReport> {
        let mut queue = self.queue.lock().await;

        let pool = self.fetcher.get(FetchOption::ForceRefresh).await?;
        queue.filter(pool.active_machines());
        let desired_size = self.init_desired_size(&pool, &queue);

        let plan = self.planner.plan(&pool, &queue, desired_size, self.clock.now());
        if plan.no_changes() && queue.is_empty() {
            return Ok(ResizeReport {
                desired_size,
                plan,
                started: Vec::new(),
                terminated: Vec::new(),
            });
        }
        info!(
            desired_size,
            to_request = plan.to_request,
            to_spare = plan.to_spare,
            to_terminate = plan.to_terminate.len(),
            queued = queue.len(),
            "resizing pool"
        );

        let mut started = Vec::new();
        let mut partial = None;

        if plan.to_spare > 0 {
            let spared = queue.spare(plan.to_spare);
            info!(spared = spared.len(), "spared machines scheduled for termination");
            self.alerts
                .publish(alerts::machines_spared(self.clock.now(), &pool, &spared));
        }

        if plan.to_request > 0 {
            match self.driver.start_machines(plan.to_request).await {
                Ok(machines) => {
                    info!(started = machines.len(), "machines started");
                    self.alerts
                        .publish(alerts::machines_started(self.clock.now(), &pool, &machines));
                    started = machines;
                }
                Err(e) => {
                    error!(
                        requested = e.requested,
                        started = e.started.len(),
                        cause = %e.cause,
                        "scale-out incomplete"
                    );
                    self.alerts
                        .publish(alerts::partial_start(self.clock.now(), &pool, &e));
                    started = e.started.clone();
                    partial = Some(e);
                }
            }
            self.fetcher.mark_stale();
        }

        if plan.has_scale_in_actions() {
            for termination in &plan.to_terminate {
                debug!(
                    machine_id = %termination.machine.id,
                    termination_time = %termination.termination_time,
                    "termination scheduled"
                );
                queue.add(termination.clone());
            }
            self.alerts.publish(alerts::terminations_scheduled(
                self.clock.now(),
                &pool,
                &plan.to_terminate,
            ));
        }

        let terminated = self.terminate_overdue(&mut queue, &pool).await;

        match partial {
            Some(e) => Err(UpdateError::PartialStart(e)),
            None => Ok(ResizeReport {
                desired_size,
                plan,
                started,
                terminated,
            }),
        }
    }

    /// Terminate every queue entry whose deadline has passed. Entries that
    /// fail are alerted and dropped; the next resize re-plans from a fresh
    /// pool.
    async fn terminate_overdue(
        &self,
        queue: &mut TerminationQueue,
        pool: &MachinePool,
    ) -> Vec<Machine> {
        let overdue = queue.pop_overdue(self.clock.now());
        let attempted = !overdue.is_empty();
        let mut terminated = Vec::with_capacity(overdue.len());

        for entry in overdue {
            let machine_id = entry.machine.id.as_str();
            match self.driver.terminate_machine(machine_id).await {
                Ok(()) => {
                    debug!(machine_id, "overdue machine terminated");
                    terminated.push(entry.machine);
                }
                Err(e) => {
                    warn!(machine_id, error = %e, "failed to terminate overdue machine");
                    self.alerts.publish(alerts::termination_failed(
                        self.clock.now(),
                        machine_id,
                        &e.to_string(),
                    ));
                }
            }
        }

        if attempted {
            self.fetcher.mark_stale();
        }
        if !terminated.is_empty() {
            info!(terminated = terminated.len(), "overdue machines terminated");
            self.alerts
                .publish(alerts::machines_terminated(self.clock.now(), pool, &terminated));
        }
        terminated
    }
}

/// Resize once per interval until shut down.
async fn run_resize_loop(inner: Arc<Inner>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(interval_secs = interval.as_secs(), "pool updater started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                inner.resize().await;
            }
            _ = shutdown.changed() => {
                info!("pool updater shutting down");
                break;
            }
        }
    }
}
