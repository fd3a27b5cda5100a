//! Domain types for a managed machine pool.
//!
//! These types describe what the cloud driver reports about each machine
//! and the immutable pool snapshots built from those reports. All types are
//! serializable so that snapshots can be persisted and attached to alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier of a machine, as assigned by the cloud provider.
pub type MachineId = String;

// ── Machine state ─────────────────────────────────────────────────

/// Execution state of a machine as reported by the cloud provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineState {
    /// Requested from the provider but not yet assigned to a host.
    Requested,
    /// Launched and booting.
    Pending,
    Running,
    Terminating,
    Terminated,
}

impl MachineState {
    /// Whether the machine occupies (or is about to occupy) a pool slot.
    pub fn is_allocated(self) -> bool {
        matches!(
            self,
            MachineState::Requested | MachineState::Pending | MachineState::Running
        )
    }

    /// Whether the machine has been launched on a host.
    pub fn is_started(self) -> bool {
        matches!(self, MachineState::Pending | MachineState::Running)
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MachineState::Requested => "REQUESTED",
            MachineState::Pending => "PENDING",
            MachineState::Running => "RUNNING",
            MachineState::Terminating => "TERMINATING",
            MachineState::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

// ── Membership ────────────────────────────────────────────────────

/// Pool membership flags of a machine.
///
/// `active` machines count toward the pool size. `evictable` machines may be
/// chosen as victims when the pool shrinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MembershipStatus {
    pub active: bool,
    pub evictable: bool,
}

impl MembershipStatus {
    pub fn new(active: bool, evictable: bool) -> Self {
        Self { active, evictable }
    }

    /// A member that is counted but must never be chosen for termination.
    pub fn blessed() -> Self {
        Self::new(true, false)
    }

    /// A machine kept in the pool for inspection but not counted.
    pub fn disposable() -> Self {
        Self::new(false, true)
    }
}

impl Default for MembershipStatus {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl std::fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(active: {}, evictable: {})", self.active, self.evictable)
    }
}

// ── Service state ─────────────────────────────────────────────────

/// Operational state of the service running on a machine, as set by the
/// operator or an external health checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    #[default]
    Unknown,
    Booting,
    InService,
    Unhealthy,
    OutOfService,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Unknown => "UNKNOWN",
            ServiceState::Booting => "BOOTING",
            ServiceState::InService => "IN_SERVICE",
            ServiceState::Unhealthy => "UNHEALTHY",
            ServiceState::OutOfService => "OUT_OF_SERVICE",
        };
        f.write_str(s)
    }
}

// ── Machine ───────────────────────────────────────────────────────

/// A single machine in the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: MachineId,
    pub machine_state: MachineState,
    #[serde(default)]
    pub membership_status: MembershipStatus,
    #[serde(default)]
    pub service_state: ServiceState,
    /// When the provider launched the machine. `None` until it is started.
    #[serde(default)]
    pub launch_time: Option<DateTime<Utc>>,
}

impl Machine {
    /// A machine with default membership and unknown service state.
    pub fn new(
        id: impl Into<MachineId>,
        machine_state: MachineState,
        launch_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: id.into(),
            machine_state,
            membership_status: MembershipStatus::default(),
            service_state: ServiceState::Unknown,
            launch_time,
        }
    }

    /// Builder-style membership override.
    pub fn with_membership(mut self, status: MembershipStatus) -> Self {
        self.membership_status = status;
        self
    }

    pub fn with_service_state(mut self, state: ServiceState) -> Self {
        self.service_state = state;
        self
    }

    /// Allocated and an active pool member.
    pub fn is_active(&self) -> bool {
        self.machine_state.is_allocated() && self.membership_status.active
    }

    /// Active and allowed to be chosen for termination.
    pub fn is_evictable(&self) -> bool {
        self.is_active() && self.membership_status.evictable
    }
}

// ── Pool ──────────────────────────────────────────────────────────

/// Immutable snapshot of the pool at a point in time.
///
/// A new snapshot is built on every successful fetch; snapshots are never
/// mutated in place and callers compare them by `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachinePool {
    pub machines: Vec<Machine>,
    pub timestamp: DateTime<Utc>,
}

impl MachinePool {
    pub fn new(machines: Vec<Machine>, timestamp: DateTime<Utc>) -> Self {
        Self {
            machines,
            timestamp,
        }
    }

    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self::new(Vec::new(), timestamp)
    }

    /// Look up a machine by id.
    pub fn get(&self, id: &str) -> Option<&Machine> {
        self.machines.iter().find(|m| m.id == id)
    }

    pub fn allocated_machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.iter().filter(|m| m.machine_state.is_allocated())
    }

    pub fn started_machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.iter().filter(|m| m.machine_state.is_started())
    }

    pub fn active_machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.iter().filter(|m| m.is_active())
    }

    /// Number of machines in an allocated state.
    pub fn allocated_count(&self) -> usize {
        self.allocated_machines().count()
    }

    pub fn active_count(&self) -> usize {
        self.active_machines().count()
    }

    /// Compact JSON rendering of pool membership, used in alert tags.
    pub fn short_summary(&self) -> serde_json::Value {
        let members: Vec<serde_json::Value> = self
            .machines
            .iter()
            .map(|m| {
                serde_json::json!({
                    "id": m.id,
                    "machineState": m.machine_state,
                    "membershipStatus": m.membership_status,
                    "serviceState": m.service_state,
                })
            })
            .collect();
        serde_json::Value::Array(members)
    }
}

/// Point-in-time size of the pool relative to its desired size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSizeSummary {
    pub timestamp: DateTime<Utc>,
    pub desired_size: usize,
    pub allocated: usize,
    pub active: usize,
}
