//! Victim selection for scale-in.
//!
//! Machines are billed per started hour, so a machine that is about to
//! cross into a new billing hour is the cheapest one to give up. Under
//! [`VictimSelectionPolicy::ClosestToInstanceHour`] victims are ranked by
//! how little of their current hour remains and are scheduled to go
//! `margin` before that boundary:
//!
//! ```text
//!   launch        launch+1h      launch+2h
//!     │──────────────│──────────────│
//!                         now   ▲   │
//!                               │   └─ instance-hour boundary
//!                               └───── termination time (boundary - margin)
//! ```
//!
//! The age-based policies terminate immediately.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::warn;

use cloudpool_core::clock::{elapsed_between, to_time_delta};
use cloudpool_core::{Machine, VictimSelectionPolicy};

use crate::queue::ScheduledTermination;

const INSTANCE_HOUR_MS: i64 = 60 * 60 * 1000;

/// The end of the machine's current billing hour: `launch + k·1h` for the
/// smallest `k >= 1` that lies strictly after `now`. Machines without a
/// launch time have no hour to protect and report `now`.
pub fn instance_hour_boundary(machine: &Machine, now: DateTime<Utc>) -> DateTime<Utc> {
    let Some(launch) = machine.launch_time else {
        return now;
    };
    if launch > now {
        return launch + TimeDelta::milliseconds(INSTANCE_HOUR_MS);
    }
    let hours_started = (now - launch).num_milliseconds() / INSTANCE_HOUR_MS;
    launch + TimeDelta::milliseconds((hours_started + 1) * INSTANCE_HOUR_MS)
}

/// Time left until the machine's next instance-hour boundary.
pub fn remaining_instance_hour(machine: &Machine, now: DateTime<Utc>) -> Duration {
    elapsed_between(now, instance_hour_boundary(machine, now))
}

/// When a machine selected under `policy` should be terminated. Never
/// earlier than `now`, even for a margin wider than the whole calendar.
pub fn termination_time(
    policy: VictimSelectionPolicy,
    machine: &Machine,
    margin: Duration,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match policy {
        VictimSelectionPolicy::ClosestToInstanceHour => {
            instance_hour_boundary(machine, now)
                .checked_sub_signed(to_time_delta(margin))
                .map_or(now, |at| at.max(now))
        }
        VictimSelectionPolicy::OldestInstance | VictimSelectionPolicy::NewestInstance => now,
    }
}

/// Order candidates from most to least preferred victim. Ties are broken
/// by machine id.
pub fn rank_candidates<'a>(
    policy: VictimSelectionPolicy,
    mut candidates: Vec<&'a Machine>,
    now: DateTime<Utc>,
) -> Vec<&'a Machine> {
    candidates.sort_by(|a, b| compare(policy, a, b, now).then_with(|| a.id.cmp(&b.id)));
    candidates
}

fn compare(policy: VictimSelectionPolicy, a: &Machine, b: &Machine, now: DateTime<Utc>) -> Ordering {
    match policy {
        VictimSelectionPolicy::ClosestToInstanceHour => {
            remaining_instance_hour(a, now).cmp(&remaining_instance_hour(b, now))
        }
        // Unlaunched machines sort last.
        VictimSelectionPolicy::OldestInstance => match (a.launch_time, b.launch_time) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        },
        // Unlaunched machines are the newest of all.
        VictimSelectionPolicy::NewestInstance => match (a.launch_time, b.launch_time) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        },
    }
}

/// Pick `count` victims from `candidates` and schedule their terminations.
/// If there are fewer candidates than requested, all of them are returned.
pub fn select_victims(
    policy: VictimSelectionPolicy,
    candidates: Vec<&Machine>,
    count: usize,
    margin: Duration,
    now: DateTime<Utc>,
) -> Vec<ScheduledTermination> {
    if candidates.len() < count {
        warn!(
            requested = count,
            available = candidates.len(),
            "not enough evictable machines to satisfy scale-in"
        );
    }
    rank_candidates(policy, candidates, now)
        .into_iter()
        .take(count)
        .map(|m| ScheduledTermination::new(m.clone(), termination_time(policy, m, margin, now)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cloudpool_core::MachineState;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn launched(id: &str, minutes_ago: i64) -> Machine {
        Machine::new(
            id,
            MachineState::Running,
            Some(now() - TimeDelta::minutes(minutes_ago)),
        )
    }

    fn ids(victims: &[ScheduledTermination]) -> Vec<&str> {
        victims.iter().map(|v| v.machine_id()).collect()
    }

    const MARGIN: Duration = Duration::from_secs(5 * 60);

    #[test]
    fn boundary_is_next_whole_hour_after_launch() {
        let m = launched("i-1", 50);
        assert_eq!(instance_hour_boundary(&m, now()), now() + TimeDelta::minutes(10));

        let m = launched("i-2", 130);
        assert_eq!(instance_hour_boundary(&m, now()), now() + TimeDelta::minutes(50));
    }

    #[test]
    fn oversized_margin_terminates_now() {
        let m = launched("i-1", 50);
        let policy = VictimSelectionPolicy::ClosestToInstanceHour;
        assert_eq!(termination_time(policy, &m, Duration::MAX, now()), now());
        assert_eq!(
            termination_time(policy, &m, Duration::from_secs(u64::MAX / 2), now()),
            now()
        );
        assert_eq!(termination_time(policy, &m, Duration::from_secs(2 * 3600), now()), now());
    }

    #[test]
    fn boundary_exactly_at_now_rolls_to_next_hour() {
        let m = launched("i-1", 60);
        assert_eq!(instance_hour_boundary(&m, now()), now() + TimeDelta::hours(1));
    }

    #[test]
    fn unlaunched_machine_has_no_remaining_hour() {
        let m = Machine::new("i-req", MachineState::Requested, None);
        assert_eq!(remaining_instance_hour(&m, now()), Duration::ZERO);
        assert_eq!(
            termination_time(VictimSelectionPolicy::ClosestToInstanceHour, &m, MARGIN, now()),
            now()
        );
    }

    #[test]
    fn closest_to_instance_hour_ranks_by_remaining_time() {
        // Remaining: i-a 40m, i-b 10m, i-c 25m.
        let machines = [launched("i-a", 20), launched("i-b", 110), launched("i-c", 35)];
        let victims = select_victims(
            VictimSelectionPolicy::ClosestToInstanceHour,
            machines.iter().collect(),
            2,
            MARGIN,
            now(),
        );
        assert_eq!(ids(&victims), vec!["i-b", "i-c"]);
        assert_eq!(victims[0].termination_time, now() + TimeDelta::minutes(5));
        assert_eq!(victims[1].termination_time, now() + TimeDelta::minutes(20));
    }

    #[test]
    fn termination_inside_margin_happens_now() {
        // Two minutes left of the hour, margin is five.
        let m = launched("i-1", 58);
        let at = termination_time(VictimSelectionPolicy::ClosestToInstanceHour, &m, MARGIN, now());
        assert_eq!(at, now());
    }

    #[test]
    fn termination_time_is_never_before_now() {
        for minutes_ago in [0, 1, 30, 55, 59, 60, 61, 119, 600] {
            let m = launched("i-1", minutes_ago);
            let at =
                termination_time(VictimSelectionPolicy::ClosestToInstanceHour, &m, MARGIN, now());
            assert!(at >= now(), "launched {minutes_ago}m ago scheduled at {at}");
            assert!(at <= instance_hour_boundary(&m, now()));
        }
    }

    #[test]
    fn ties_break_by_machine_id() {
        let machines = [launched("i-z", 30), launched("i-m", 30), launched("i-a", 30)];
        for policy in [
            VictimSelectionPolicy::ClosestToInstanceHour,
            VictimSelectionPolicy::OldestInstance,
            VictimSelectionPolicy::NewestInstance,
        ] {
            let victims = select_victims(policy, machines.iter().collect(), 3, MARGIN, now());
            assert_eq!(ids(&victims), vec!["i-a", "i-m", "i-z"], "{policy}");
        }
    }

    #[test]
    fn oldest_and_newest_terminate_immediately() {
        let machines = [
            launched("i-old", 300),
            launched("i-new", 5),
            Machine::new("i-pending", MachineState::Pending, None),
        ];

        let oldest = select_victims(
            VictimSelectionPolicy::OldestInstance,
            machines.iter().collect(),
            3,
            MARGIN,
            now(),
        );
        assert_eq!(ids(&oldest), vec!["i-old", "i-new", "i-pending"]);
        assert!(oldest.iter().all(|v| v.termination_time == now()));

        let newest = select_victims(
            VictimSelectionPolicy::NewestInstance,
            machines.iter().collect(),
            3,
            MARGIN,
            now(),
        );
        assert_eq!(ids(&newest), vec!["i-pending", "i-new", "i-old"]);
    }

    #[test]
    fn too_few_candidates_selects_all() {
        let machines = [launched("i-1", 10)];
        let victims = select_victims(
            VictimSelectionPolicy::OldestInstance,
            machines.iter().collect(),
            3,
            MARGIN,
            now(),
        );
        assert_eq!(victims.len(), 1);
    }
}
