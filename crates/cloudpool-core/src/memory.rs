//! In-memory cloud driver.
//!
//! Keeps a machine table in process and implements every [`CloudDriver`]
//! operation against it. Used by the daemon's simulate mode and as the
//! driver in tests, where its call counters and failure injection stand in
//! for a flaky provider API.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::driver::CloudDriver;
use crate::error::{DriverError, DriverResult, StartMachinesError};
use crate::types::{Machine, MachineState, MembershipStatus, ServiceState};

#[derive(Default)]
struct Faults {
    /// Number of upcoming list calls that fail.
    failing_lists: usize,
    /// Fail every list call until cleared.
    lists_down: bool,
    /// Maximum machines a single start call launches before failing.
    start_limit: Option<usize>,
}

#[derive(Default)]
struct Table {
    /// Machines that belong to the pool, keyed by id.
    members: BTreeMap<String, Machine>,
    /// Machines known to the provider but outside the pool (attachable).
    outside: BTreeMap<String, Machine>,
    next_id: usize,
}

/// Call counters, one per driver operation.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub list: AtomicUsize,
    pub start: AtomicUsize,
    pub terminate: AtomicUsize,
    pub attach: AtomicUsize,
    pub detach: AtomicUsize,
    pub set_service_state: AtomicUsize,
    pub set_membership_status: AtomicUsize,
}

pub struct InMemoryDriver {
    table: RwLock<Table>,
    faults: RwLock<Faults>,
    calls: CallCounts,
    clock: Arc<dyn Clock>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            table: RwLock::new(Table::default()),
            faults: RwLock::new(Faults::default()),
            calls: CallCounts::default(),
            clock,
        }
    }

    /// Seed the pool with an existing machine.
    pub fn insert(&self, machine: Machine) {
        let mut table = self.table.write();
        table.outside.remove(&machine.id);
        table.members.insert(machine.id.clone(), machine);
    }

    /// Seed a machine the provider knows about but the pool does not.
    pub fn insert_outside(&self, machine: Machine) {
        self.table.write().outside.insert(machine.id.clone(), machine);
    }

    /// Launch `count` running machines directly, bypassing call counters.
    pub fn seed_running(&self, count: usize) -> Vec<Machine> {
        let now = self.clock.now();
        let mut table = self.table.write();
        (0..count)
            .map(|_| {
                let machine = Machine::new(next_id(&mut table), MachineState::Running, Some(now));
                table.members.insert(machine.id.clone(), machine.clone());
                machine
            })
            .collect()
    }

    /// Remove a machine as if it had been deleted from the provider console.
    pub fn vanish(&self, machine_id: &str) -> Option<Machine> {
        self.table.write().members.remove(machine_id)
    }

    pub fn machine(&self, machine_id: &str) -> Option<Machine> {
        self.table.read().members.get(machine_id).cloned()
    }

    pub fn machines(&self) -> Vec<Machine> {
        self.table.read().members.values().cloned().collect()
    }

    /// Number of pool members in an allocated state.
    pub fn allocated_count(&self) -> usize {
        self.table
            .read()
            .members
            .values()
            .filter(|m| m.machine_state.is_allocated())
            .count()
    }

    pub fn calls(&self) -> &CallCounts {
        &self.calls
    }

    pub fn list_calls(&self) -> usize {
        self.calls.list.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> usize {
        self.calls.terminate.load(Ordering::SeqCst)
    }

    /// Make the next `n` list calls fail.
    pub fn fail_next_lists(&self, n: usize) {
        self.faults.write().failing_lists = n;
    }

    /// Make every list call fail until called again with `false`.
    pub fn fail_lists(&self, down: bool) {
        self.faults.write().lists_down = down;
    }

    /// Cap how many machines a start call launches before reporting failure.
    pub fn limit_starts(&self, limit: Option<usize>) {
        self.faults.write().start_limit = limit;
    }

    fn member_mut<'a>(table: &'a mut Table, machine_id: &str) -> DriverResult<&'a mut Machine> {
        table
            .members
            .get_mut(machine_id)
            .ok_or_else(|| DriverError::NotFound(machine_id.to_string()))
    }
}

impl Default for InMemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn next_id(table: &mut Table) -> String {
    table.next_id += 1;
    format!("i-{:04}", table.next_id)
}

#[async_trait]
impl CloudDriver for InMemoryDriver {
    async fn list_machines(&self) -> DriverResult<Vec<Machine>> {
        self.calls.list.fetch_add(1, Ordering::SeqCst);
        {
            let mut faults = self.faults.write();
            if faults.lists_down {
                return Err(DriverError::Api("provider api unavailable".into()));
            }
            if faults.failing_lists > 0 {
                faults.failing_lists -= 1;
                return Err(DriverError::Api("transient list failure".into()));
            }
        }
        Ok(self.machines())
    }

    async fn start_machines(&self, count: usize) -> Result<Vec<Machine>, StartMachinesError> {
        self.calls.start.fetch_add(1, Ordering::SeqCst);
        let limit = self.faults.read().start_limit;
        let launchable = limit.map_or(count, |l| l.min(count));

        let now = self.clock.now();
        let mut table = self.table.write();
        let started: Vec<Machine> = (0..launchable)
            .map(|_| {
                let machine = Machine::new(next_id(&mut table), MachineState::Running, Some(now));
                table.members.insert(machine.id.clone(), machine.clone());
                machine
            })
            .collect();
        debug!(requested = count, started = started.len(), "in-memory start");

        if started.len() < count {
            return Err(StartMachinesError::new(
                count,
                started,
                "instance quota exceeded",
            ));
        }
        Ok(started)
    }

    async fn terminate_machine(&self, machine_id: &str) -> DriverResult<()> {
        self.calls.terminate.fetch_add(1, Ordering::SeqCst);
        let mut table = self.table.write();
        let machine = Self::member_mut(&mut table, machine_id)?;
        machine.machine_state = MachineState::Terminated;
        Ok(())
    }

    async fn attach_machine(&self, machine_id: &str) -> DriverResult<()> {
        self.calls.attach.fetch_add(1, Ordering::SeqCst);
        let mut table = self.table.write();
        let machine = table
            .outside
            .remove(machine_id)
            .ok_or_else(|| DriverError::NotFound(machine_id.to_string()))?;
        table.members.insert(machine.id.clone(), machine);
        Ok(())
    }

    async fn detach_machine(&self, machine_id: &str) -> DriverResult<()> {
        self.calls.detach.fetch_add(1, Ordering::SeqCst);
        let mut table = self.table.write();
        let machine = table
            .members
            .remove(machine_id)
            .ok_or_else(|| DriverError::NotFound(machine_id.to_string()))?;
        table.outside.insert(machine.id.clone(), machine);
        Ok(())
    }

    async fn set_service_state(&self, machine_id: &str, state: ServiceState) -> DriverResult<()> {
        self.calls.set_service_state.fetch_add(1, Ordering::SeqCst);
        let mut table = self.table.write();
        Self::member_mut(&mut table, machine_id)?.service_state = state;
        Ok(())
    }

    async fn set_membership_status(
        &self,
        machine_id: &str,
        status: MembershipStatus,
    ) -> DriverResult<()> {
        self.calls.set_membership_status.fetch_add(1, Ordering::SeqCst);
        let mut table = self.table.write();
        Self::member_mut(&mut table, machine_id)?.membership_status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_and_terminate() {
        let driver = InMemoryDriver::new();
        let started = driver.start_machines(2).await.unwrap();
        assert_eq!(started.len(), 2);
        assert_eq!(started[0].id, "i-0001");
        assert_eq!(driver.allocated_count(), 2);

        driver.terminate_machine("i-0001").await.unwrap();
        assert_eq!(
            driver.machine("i-0001").unwrap().machine_state,
            MachineState::Terminated
        );
        assert_eq!(driver.allocated_count(), 1);
    }

    #[tokio::test]
    async fn unknown_machine_is_not_found() {
        let driver = InMemoryDriver::new();
        assert_eq!(
            driver.terminate_machine("i-404").await,
            Err(DriverError::NotFound("i-404".into()))
        );
        assert!(driver.attach_machine("i-404").await.is_err());
    }

    #[tokio::test]
    async fn partial_start_reports_started_machines() {
        let driver = InMemoryDriver::new();
        driver.limit_starts(Some(1));

        let err = driver.start_machines(3).await.unwrap_err();
        assert_eq!(err.requested, 3);
        assert_eq!(err.started_ids(), vec!["i-0001".to_string()]);
        assert_eq!(driver.allocated_count(), 1);
    }

    #[tokio::test]
    async fn list_failure_injection() {
        let driver = InMemoryDriver::new();
        driver.seed_running(1);
        driver.fail_next_lists(2);

        assert!(driver.list_machines().await.is_err());
        assert!(driver.list_machines().await.is_err());
        assert_eq!(driver.list_machines().await.unwrap().len(), 1);
        assert_eq!(driver.list_calls(), 3);

        driver.fail_lists(true);
        assert!(driver.list_machines().await.is_err());
    }

    #[tokio::test]
    async fn detach_then_attach_moves_membership() {
        let driver = InMemoryDriver::new();
        let ids: Vec<_> = driver.seed_running(2).into_iter().map(|m| m.id).collect();

        driver.detach_machine(&ids[0]).await.unwrap();
        assert_eq!(driver.machines().len(), 1);

        driver.attach_machine(&ids[0]).await.unwrap();
        assert_eq!(driver.machines().len(), 2);
    }

    #[tokio::test]
    async fn setters_update_machine() {
        let driver = InMemoryDriver::new();
        let id = driver.seed_running(1).remove(0).id;

        driver
            .set_service_state(&id, ServiceState::InService)
            .await
            .unwrap();
        driver
            .set_membership_status(&id, MembershipStatus::blessed())
            .await
            .unwrap();

        let m = driver.machine(&id).unwrap();
        assert_eq!(m.service_state, ServiceState::InService);
        assert_eq!(m.membership_status, MembershipStatus::blessed());
    }
}
