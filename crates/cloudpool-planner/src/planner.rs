use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use cloudpool_core::{Machine, MachinePool, VictimSelectionPolicy};

use crate::queue::{ScheduledTermination, TerminationQueue};
use crate::victim::select_victims;

/// Actions needed to move the pool towards its desired size.
///
/// Scale-out and scale-in are mutually exclusive: a plan either requests
/// and spares machines, or schedules terminations, never both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizePlan {
    /// New machines to start.
    pub to_request: usize,
    /// Active machines to add to the termination queue.
    pub to_terminate: Vec<ScheduledTermination>,
    /// Queued terminations to cancel.
    pub to_spare: usize,
}

impl ResizePlan {
    pub fn has_scale_out_actions(&self) -> bool {
        self.to_request > 0 || self.to_spare > 0
    }

    pub fn has_scale_in_actions(&self) -> bool {
        !self.to_terminate.is_empty()
    }

    pub fn no_changes(&self) -> bool {
        !self.has_scale_out_actions() && !self.has_scale_in_actions()
    }
}

/// Computes [`ResizePlan`]s. Holds no state; the termination queue is
/// owned by the caller.
#[derive(Debug, Clone, Copy)]
pub struct ResizePlanner {
    policy: VictimSelectionPolicy,
    instance_hour_margin: Duration,
}

impl ResizePlanner {
    pub fn new(policy: VictimSelectionPolicy, instance_hour_margin: Duration) -> Self {
        Self {
            policy,
            instance_hour_margin,
        }
    }

    pub fn policy(&self) -> VictimSelectionPolicy {
        self.policy
    }

    pub fn instance_hour_margin(&self) -> Duration {
        self.instance_hour_margin
    }

    /// Active machines not already scheduled for termination.
    pub fn net_size(pool: &MachinePool, queue: &TerminationQueue) -> usize {
        pool.active_machines()
            .filter(|m| !queue.contains(&m.id))
            .count()
    }

    pub fn plan(
        &self,
        pool: &MachinePool,
        queue: &TerminationQueue,
        desired_size: usize,
        now: DateTime<Utc>,
    ) -> ResizePlan {
        let active: Vec<&Machine> = pool.active_machines().collect();
        let queued = active.iter().filter(|m| queue.contains(&m.id)).count();
        let net_size = active.len() - queued;

        let plan = if desired_size > net_size {
            let deficit = desired_size - net_size;
            let to_spare = deficit.min(queued);
            ResizePlan {
                to_request: deficit - to_spare,
                to_terminate: Vec::new(),
                to_spare,
            }
        } else if desired_size < net_size {
            let surplus = net_size - desired_size;
            let candidates: Vec<&Machine> = active
                .into_iter()
                .filter(|m| m.is_evictable() && !queue.contains(&m.id))
                .collect();
            ResizePlan {
                to_request: 0,
                to_terminate: select_victims(
                    self.policy,
                    candidates,
                    surplus,
                    self.instance_hour_margin,
                    now,
                ),
                to_spare: 0,
            }
        } else {
            ResizePlan::default()
        };

        debug!(
            desired_size,
            net_size,
            queued,
            to_request = plan.to_request,
            to_spare = plan.to_spare,
            to_terminate = plan.to_terminate.len(),
            "resize plan computed"
        );
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use cloudpool_core::{MachineState, MembershipStatus};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn planner() -> ResizePlanner {
        ResizePlanner::new(
            VictimSelectionPolicy::ClosestToInstanceHour,
            Duration::from_secs(300),
        )
    }

    fn running(id: &str, minutes_ago: i64) -> Machine {
        Machine::new(
            id,
            MachineState::Running,
            Some(now() - TimeDelta::minutes(minutes_ago)),
        )
    }

    fn pool_of(machines: Vec<Machine>) -> MachinePool {
        MachinePool::new(machines, now())
    }

    fn queue_of(pool: &MachinePool, ids: &[&str]) -> TerminationQueue {
        let mut queue = TerminationQueue::new();
        for id in ids {
            let m = pool.get(id).unwrap().clone();
            queue.add(ScheduledTermination::new(m, now() + TimeDelta::minutes(30)));
        }
        queue
    }

    #[test]
    fn steady_state_has_no_changes() {
        let pool = pool_of(vec![running("i-1", 10), running("i-2", 20)]);
        let plan = planner().plan(&pool, &TerminationQueue::new(), 2, now());
        assert!(plan.no_changes());
    }

    #[test]
    fn scale_out_spares_before_requesting() {
        let pool = pool_of((1..=4).map(|i| running(&format!("i-{i}"), 10)).collect());
        let queue = queue_of(&pool, &["i-3", "i-4"]);

        // Net size is 2.
        let plan = planner().plan(&pool, &queue, 3, now());
        assert_eq!(plan.to_spare, 1);
        assert_eq!(plan.to_request, 0);

        let plan = planner().plan(&pool, &queue, 7, now());
        assert_eq!(plan.to_spare, 2);
        assert_eq!(plan.to_request, 3);
        assert!(plan.has_scale_out_actions());
        assert!(!plan.has_scale_in_actions());
    }

    #[test]
    fn scale_in_schedules_exactly_the_surplus() {
        let pool = pool_of((1..=5).map(|i| running(&format!("i-{i}"), i * 7)).collect());
        let queue = queue_of(&pool, &["i-5"]);

        let plan = planner().plan(&pool, &queue, 1, now());
        assert_eq!(plan.to_terminate.len(), 3);
        assert_eq!(plan.to_request, 0);
        assert_eq!(plan.to_spare, 0);
        assert!(plan.to_terminate.iter().all(|t| !queue.contains(t.machine_id())));
    }

    #[test]
    fn scale_in_skips_non_evictable_machines() {
        let pool = pool_of(vec![
            running("i-1", 55).with_membership(MembershipStatus::blessed()),
            running("i-2", 10),
            running("i-3", 20),
        ]);
        let plan = planner().plan(&pool, &TerminationQueue::new(), 1, now());
        let ids: Vec<_> = plan.to_terminate.iter().map(|t| t.machine_id()).collect();
        assert_eq!(ids, vec!["i-3", "i-2"]);
    }

    #[test]
    fn inactive_machines_do_not_count() {
        let pool = pool_of(vec![
            running("i-1", 10),
            running("i-2", 10).with_membership(MembershipStatus::disposable()),
            Machine::new("i-3", MachineState::Terminated, None),
        ]);
        let plan = planner().plan(&pool, &TerminationQueue::new(), 2, now());
        assert_eq!(plan.to_request, 1);
    }

    #[test]
    fn plan_arithmetic_holds_across_targets() {
        let pool = pool_of((1..=6).map(|i| running(&format!("i-{i}"), i * 9)).collect());
        let queue = queue_of(&pool, &["i-1", "i-2"]);
        let net = ResizePlanner::net_size(&pool, &queue);
        assert_eq!(net, 4);

        for target in 0..10 {
            let plan = planner().plan(&pool, &queue, target, now());
            assert!(!(plan.has_scale_out_actions() && plan.has_scale_in_actions()));
            if target > net {
                let deficit = target - net;
                assert_eq!(plan.to_spare, deficit.min(queue.len()));
                assert_eq!(plan.to_request, deficit - plan.to_spare);
            } else {
                assert_eq!(plan.to_terminate.len(), net - target);
            }
            for t in &plan.to_terminate {
                assert!(t.termination_time >= now());
            }
        }
    }

    #[test]
    fn pending_machines_are_active() {
        let pool = pool_of(vec![
            Machine::new("i-1", MachineState::Requested, None),
            Machine::new("i-2", MachineState::Pending, None),
        ]);
        let plan = planner().plan(&pool, &TerminationQueue::new(), 2, now());
        assert!(plan.no_changes());
    }
}
