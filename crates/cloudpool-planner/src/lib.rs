//! cloudpool-planner — decide how the pool should change.
//!
//! Given the latest pool snapshot, the current termination queue, and a
//! desired size, [`ResizePlanner`] produces a [`ResizePlan`]:
//!
//! - **Scale-out**: spare queued terminations first, request new machines
//!   for the rest of the deficit.
//! - **Scale-in**: pick victims among evictable machines that are not
//!   already queued, using the configured [`VictimSelectionPolicy`].
//!
//! The planner is pure; applying the plan is left to the caller.
//!
//! [`VictimSelectionPolicy`]: cloudpool_core::VictimSelectionPolicy

pub mod planner;
pub mod queue;
pub mod victim;

pub use planner::{ResizePlan, ResizePlanner};
pub use queue::{ScheduledTermination, TerminationQueue};
pub use victim::{instance_hour_boundary, remaining_instance_hour, select_victims, termination_time};
