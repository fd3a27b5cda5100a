//! Alert builders for pool updates.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use cloudpool_core::{
    Alert, AlertSeverity, AlertTopic, Machine, MachinePool, MembershipStatus, ServiceState,
    StartMachinesError,
};
use cloudpool_planner::ScheduledTermination;

fn machine_ids<'a>(machines: impl IntoIterator<Item = &'a Machine>) -> Value {
    Value::Array(
        machines
            .into_iter()
            .map(|m| Value::String(m.id.clone()))
            .collect(),
    )
}

fn resize(severity: AlertSeverity, now: DateTime<Utc>, message: String, pool: &MachinePool) -> Alert {
    Alert::new(AlertTopic::Resize, severity, now, message).with_tag("poolMembers", pool.short_summary())
}

pub fn machines_started(now: DateTime<Utc>, pool: &MachinePool, started: &[Machine]) -> Alert {
    resize(
        AlertSeverity::Info,
        now,
        format!("started {} new machine(s)", started.len()),
        pool,
    )
    .with_tag("startedMachines", machine_ids(started))
}

pub fn partial_start(now: DateTime<Utc>, pool: &MachinePool, err: &StartMachinesError) -> Alert {
    resize(
        AlertSeverity::Error,
        now,
        format!(
            "scale-out incomplete: started {} of {} requested machine(s)",
            err.started.len(),
            err.requested
        ),
        pool,
    )
    .with_details(err.cause.clone())
    .with_tag("startedMachines", machine_ids(&err.started))
}

pub fn machines_spared(
    now: DateTime<Utc>,
    pool: &MachinePool,
    spared: &[ScheduledTermination],
) -> Alert {
    resize(
        AlertSeverity::Info,
        now,
        format!("spared {} machine(s) scheduled for termination", spared.len()),
        pool,
    )
    .with_tag("sparedMachines", machine_ids(spared.iter().map(|s| &s.machine)))
}

pub fn terminations_scheduled(
    now: DateTime<Utc>,
    pool: &MachinePool,
    scheduled: &[ScheduledTermination],
) -> Alert {
    let entries = scheduled
        .iter()
        .map(|s| json!({ "id": s.machine.id, "terminationTime": s.termination_time }))
        .collect();
    resize(
        AlertSeverity::Info,
        now,
        format!("scheduled {} machine(s) for termination", scheduled.len()),
        pool,
    )
    .with_tag("scheduledTerminations", Value::Array(entries))
}

pub fn machines_terminated(now: DateTime<Utc>, pool: &MachinePool, terminated: &[Machine]) -> Alert {
    resize(
        AlertSeverity::Info,
        now,
        format!("terminated {} machine(s)", terminated.len()),
        pool,
    )
    .with_tag("terminatedMachines", machine_ids(terminated))
}

pub fn termination_failed(now: DateTime<Utc>, machine_id: &str, error: &str) -> Alert {
    Alert::new(
        AlertTopic::Resize,
        AlertSeverity::Warn,
        now,
        format!("failed to terminate machine {machine_id}"),
    )
    .with_details(error)
    .with_tag("machineId", json!(machine_id))
}

pub fn resize_failed(now: DateTime<Utc>, error: &str) -> Alert {
    Alert::new(AlertTopic::Resize, AlertSeverity::Error, now, "failed to resize pool")
        .with_details(error)
}

pub fn desired_size_changed(now: DateTime<Utc>, from: Option<usize>, to: usize) -> Alert {
    Alert::new(
        AlertTopic::Resize,
        AlertSeverity::Info,
        now,
        format!("desired size set to {to}"),
    )
    .with_tag("previousDesiredSize", json!(from))
    .with_tag("desiredSize", json!(to))
}

pub fn machine_terminated(now: DateTime<Utc>, machine_id: &str) -> Alert {
    Alert::new(
        AlertTopic::Resize,
        AlertSeverity::Info,
        now,
        format!("terminated machine {machine_id}"),
    )
    .with_tag("terminatedMachines", json!([machine_id]))
}

pub fn machine_attached(now: DateTime<Utc>, machine_id: &str) -> Alert {
    Alert::new(
        AlertTopic::Resize,
        AlertSeverity::Info,
        now,
        format!("attached machine {machine_id}"),
    )
    .with_tag("machineId", json!(machine_id))
}

pub fn machine_detached(now: DateTime<Utc>, machine_id: &str) -> Alert {
    Alert::new(
        AlertTopic::Resize,
        AlertSeverity::Info,
        now,
        format!("detached machine {machine_id}"),
    )
    .with_tag("machineId", json!(machine_id))
}

pub fn service_state_changed(now: DateTime<Utc>, machine_id: &str, state: ServiceState) -> Alert {
    Alert::new(
        AlertTopic::ServiceState,
        AlertSeverity::Debug,
        now,
        format!("service state of {machine_id} set to {state}"),
    )
    .with_tag("machineId", json!(machine_id))
    .with_tag("serviceState", json!(state))
}

pub fn membership_status_changed(
    now: DateTime<Utc>,
    machine_id: &str,
    status: MembershipStatus,
) -> Alert {
    Alert::new(
        AlertTopic::MembershipStatus,
        AlertSeverity::Info,
        now,
        format!("membership status of {machine_id} set to {status}"),
    )
    .with_tag("machineId", json!(machine_id))
    .with_tag("membershipStatus", json!(status))
}
