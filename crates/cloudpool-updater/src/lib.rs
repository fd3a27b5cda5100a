//! cloudpool-updater — the reconciliation engine.
//!
//! [`PoolUpdater`] owns the desired size and the termination queue. On every
//! tick it forces a fresh pool observation, plans a resize with
//! [`ResizePlanner`](cloudpool_planner::ResizePlanner), applies the plan
//! through the [`CloudDriver`](cloudpool_core::CloudDriver), and terminates
//! queued machines whose deadline has passed. Manual mutations (terminate,
//! attach, detach) go through the same update lock so they never interleave
//! with a resize.

pub mod alerts;
pub mod error;
pub mod updater;

pub use error::{UpdateError, UpdateResult};
pub use updater::{PoolUpdater, ResizeReport};
