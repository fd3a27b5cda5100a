//! Cloud driver boundary.
//!
//! A driver translates pool operations into calls against one provider's
//! native API. The reconciliation engine treats it as a black box that can
//! fail, be slow, or report eventually-consistent state.

use async_trait::async_trait;

use crate::error::{DriverResult, StartMachinesError};
use crate::types::{Machine, MembershipStatus, ServiceState};

/// Operations a cloud provider integration must expose.
#[async_trait]
pub trait CloudDriver: Send + Sync {
    /// List every machine the provider associates with the pool, including
    /// ones that are shutting down or already terminated.
    async fn list_machines(&self) -> DriverResult<Vec<Machine>>;

    /// Request `count` new machines.
    ///
    /// When only some of them could be launched, the error carries the
    /// machines that did start.
    async fn start_machines(&self, count: usize) -> Result<Vec<Machine>, StartMachinesError>;

    /// Terminate a pool member.
    async fn terminate_machine(&self, machine_id: &str) -> DriverResult<()>;

    /// Bring an existing machine that is not yet part of the pool into it.
    async fn attach_machine(&self, machine_id: &str) -> DriverResult<()>;

    /// Remove a machine from the pool without terminating it.
    async fn detach_machine(&self, machine_id: &str) -> DriverResult<()>;

    /// Record whether a machine is serving traffic.
    async fn set_service_state(&self, machine_id: &str, state: ServiceState) -> DriverResult<()>;

    /// Change whether a machine counts toward the pool and may be evicted.
    async fn set_membership_status(
        &self,
        machine_id: &str,
        status: MembershipStatus,
    ) -> DriverResult<()>;
}
