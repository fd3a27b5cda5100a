//! Machines scheduled for future termination.
//!
//! The queue holds at most one entry per machine id. Entries keep their
//! insertion order, which is the order in which they are spared when demand
//! grows back; [`entries`](TerminationQueue::entries) and
//! [`pop_overdue`](TerminationQueue::pop_overdue) report them ordered by
//! termination time instead.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use cloudpool_core::Machine;

/// A machine selected for termination and the time it should go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTermination {
    pub machine: Machine,
    pub termination_time: DateTime<Utc>,
}

impl ScheduledTermination {
    pub fn new(machine: Machine, termination_time: DateTime<Utc>) -> Self {
        Self {
            machine,
            termination_time,
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine.id
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.termination_time <= now
    }
}

#[derive(Debug, Clone, Default)]
pub struct TerminationQueue {
    /// Insertion order.
    entries: Vec<ScheduledTermination>,
}

impl TerminationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update the entry for a machine. An updated entry keeps its
    /// original queue position. Returns `true` if the machine was not queued.
    pub fn add(&mut self, termination: ScheduledTermination) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.machine.id == termination.machine.id)
        {
            Some(existing) => {
                *existing = termination;
                false
            }
            None => {
                self.entries.push(termination);
                true
            }
        }
    }

    pub fn remove(&mut self, machine_id: &str) -> Option<ScheduledTermination> {
        let pos = self.entries.iter().position(|e| e.machine.id == machine_id)?;
        Some(self.entries.remove(pos))
    }

    /// Whether the machine is scheduled for termination.
    pub fn contains(&self, machine_id: &str) -> bool {
        self.entries.iter().any(|e| e.machine.id == machine_id)
    }

    /// Number of scheduled terminations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry whose machine is not among `active`. Returns the
    /// dropped entries.
    pub fn filter<'a>(
        &mut self,
        active: impl IntoIterator<Item = &'a Machine>,
    ) -> Vec<ScheduledTermination> {
        let keep: HashSet<&str> = active.into_iter().map(|m| m.id.as_str()).collect();
        let (kept, dropped): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| keep.contains(e.machine.id.as_str()));
        self.entries = kept;
        if !dropped.is_empty() {
            debug!(dropped = dropped.len(), "purged terminations of vanished machines");
        }
        dropped
    }

    /// Remove up to `count` entries, earliest-queued first.
    pub fn spare(&mut self, count: usize) -> Vec<ScheduledTermination> {
        let n = count.min(self.entries.len());
        self.entries.drain(..n).collect()
    }

    /// Remove and return every entry due at or before `now`, ordered by
    /// termination time.
    pub fn pop_overdue(&mut self, now: DateTime<Utc>) -> Vec<ScheduledTermination> {
        let (mut overdue, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.is_overdue(now));
        self.entries = pending;
        sort_by_deadline(&mut overdue);
        overdue
    }

    /// Entries ordered by termination time, then machine id.
    pub fn entries(&self) -> Vec<ScheduledTermination> {
        let mut entries = self.entries.clone();
        sort_by_deadline(&mut entries);
        entries
    }

    pub fn machine_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.machine.id.clone()).collect()
    }
}

fn sort_by_deadline(entries: &mut [ScheduledTermination]) {
    entries.sort_by(|a, b| {
        a.termination_time
            .cmp(&b.termination_time)
            .then_with(|| a.machine.id.cmp(&b.machine.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use cloudpool_core::MachineState;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn machine(id: &str) -> Machine {
        Machine::new(id, MachineState::Running, Some(t0()))
    }

    fn at(id: &str, minutes: i64) -> ScheduledTermination {
        ScheduledTermination::new(machine(id), t0() + TimeDelta::minutes(minutes))
    }

    #[test]
    fn add_is_an_upsert_by_machine_id() {
        let mut queue = TerminationQueue::new();
        assert!(queue.add(at("i-1", 10)));
        assert!(queue.add(at("i-2", 5)));
        assert!(!queue.add(at("i-1", 1)));

        assert_eq!(queue.len(), 2);
        let entries = queue.entries();
        assert_eq!(entries[0].machine_id(), "i-1");
        assert_eq!(entries[0].termination_time, t0() + TimeDelta::minutes(1));
    }

    #[test]
    fn filter_drops_machines_no_longer_active() {
        let mut queue = TerminationQueue::new();
        queue.add(at("i-1", 10));
        queue.add(at("i-2", 10));
        queue.add(at("i-3", 10));

        let active = [machine("i-2"), machine("i-9")];
        let dropped = queue.filter(active.iter());

        assert_eq!(dropped.len(), 2);
        assert_eq!(queue.machine_ids(), vec!["i-2".to_string()]);
    }

    #[test]
    fn spare_is_fifo_by_insertion() {
        let mut queue = TerminationQueue::new();
        queue.add(at("i-c", 30));
        queue.add(at("i-a", 10));
        queue.add(at("i-b", 20));

        let spared = queue.spare(2);
        let ids: Vec<_> = spared.iter().map(|s| s.machine_id()).collect();
        assert_eq!(ids, vec!["i-c", "i-a"]);
        assert_eq!(queue.machine_ids(), vec!["i-b".to_string()]);

        assert_eq!(queue.spare(5).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_overdue_takes_only_due_entries() {
        let mut queue = TerminationQueue::new();
        queue.add(at("i-late", 30));
        queue.add(at("i-due", 0));
        queue.add(at("i-past", -5));

        let overdue = queue.pop_overdue(t0());
        let ids: Vec<_> = overdue.iter().map(|s| s.machine_id()).collect();
        assert_eq!(ids, vec!["i-past", "i-due"]);
        assert_eq!(queue.machine_ids(), vec!["i-late".to_string()]);

        assert!(queue.pop_overdue(t0()).is_empty());
    }

    #[test]
    fn remove_and_contains() {
        let mut queue = TerminationQueue::new();
        queue.add(at("i-1", 10));
        assert!(queue.contains("i-1"));
        assert!(queue.remove("i-1").is_some());
        assert!(!queue.contains("i-1"));
        assert!(queue.remove("i-1").is_none());
    }
}
