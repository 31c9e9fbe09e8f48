//! Per-job background bagging
//!
//! Each job id owns a small file-backed queue ([`UpdateQueue`]). A
//! [`BaggingWorker`] drains it on its own thread, applying updates to the bag
//! and running the preservation hand-off when an item is tagged for it. The
//! [`WorkerRegistry`] keeps at most one worker alive per id.

pub mod bagger;
pub mod preserver;
pub mod queue;
pub mod registry;
pub mod updater;

pub use bagger::BaggingWorker;
pub use preserver::Preserver;
pub use queue::{QueueItem, Slot, UpdateQueue};
pub use registry::WorkerRegistry;
pub use updater::{PackageUpdater, ReadModel};

use crate::error::Result;
use serde_json::Value;

/// Applies one queued update to a job's bag
pub trait UpdateApplier: Send + Sync {
    fn apply(&self, id: &str, update: &Value) -> Result<()>;

    /// Rebuild anything derived from the bag after an update
    fn refresh(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

/// The synchronous preservation step run for hand-off items
pub trait HandOff: Send + Sync {
    /// Prepare the bag (identifier, finalization)
    fn enhance(&self, id: &str) -> Result<()>;

    /// Split and deliver the finished bag
    fn hand_off(&self, id: &str) -> Result<()>;
}
