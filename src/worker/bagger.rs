use super::queue::{QueueItem, UpdateQueue};
use super::{HandOff, UpdateApplier};
use crate::error::{BagError, Result};
use crate::status::JobStatus;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

enum Advance {
    Idle,
    Done,
    HandOffFailed(BagError),
}

/// Drains one job's queue
///
/// Items are applied in arrival order, except that a hand-off item in
/// `preserve` goes ahead of a waiting `next`. A failed update is logged and
/// skipped (its hand-off too, if it carried one); a failed hand-off ends the
/// run with that error.
pub struct BaggingWorker {
    queue: UpdateQueue,
    applier: Arc<dyn UpdateApplier>,
    hand_off: Arc<dyn HandOff>,
    poll: Duration,
    status_dir: Option<PathBuf>,
}

impl BaggingWorker {
    pub fn new(
        queue: UpdateQueue,
        applier: Arc<dyn UpdateApplier>,
        hand_off: Arc<dyn HandOff>,
    ) -> Self {
        BaggingWorker {
            queue,
            applier,
            hand_off,
            poll: Duration::from_millis(100),
            status_dir: None,
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Note skipped updates in the job's status record
    pub fn with_status_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.status_dir = Some(dir.into());
        self
    }

    pub fn id(&self) -> &str {
        self.queue.id()
    }

    pub fn queue(&self) -> &UpdateQueue {
        &self.queue
    }

    /// True while any slot holds an item
    pub fn has_pending(&self) -> Result<bool> {
        self.queue.is_populated()
    }

    /// Process items until the queue is empty
    pub fn run(&self) -> Result<()> {
        info!("Worker for {} started", self.id());
        let mut processed = 0usize;
        let mut failure: Option<BagError> = None;
        while self.queue.is_populated()? {
            match self.advance()? {
                Advance::Idle => thread::sleep(self.poll),
                Advance::Done => processed += 1,
                Advance::HandOffFailed(e) => {
                    processed += 1;
                    failure.get_or_insert(e);
                }
            }
        }
        info!("Worker for {} idle after {} item(s)", self.id(), processed);
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Promote and process at most one item; false if nothing was ready
    pub fn step(&self) -> Result<bool> {
        match self.advance()? {
            Advance::Idle => Ok(false),
            Advance::Done => Ok(true),
            Advance::HandOffFailed(e) => Err(e),
        }
    }

    fn advance(&self) -> Result<Advance> {
        self.queue.promote()?;
        let item = match self.queue.load_current() {
            Ok(Some(item)) => item,
            Ok(None) => return Ok(Advance::Idle),
            Err(e) if !e.is_state_error() => {
                error!("Discarding unreadable queue item for {}: {}", self.id(), e);
                self.queue.clear_current()?;
                return Ok(Advance::Done);
            }
            Err(e) => return Err(e),
        };
        self.process(item)
    }

    fn process(&self, item: QueueItem) -> Result<Advance> {
        let id = self.id().to_string();
        let applied = self
            .applier
            .apply(&id, &item.payload)
            .and_then(|_| self.applier.refresh(&id));

        if let Err(e) = applied {
            error!("Update for {} failed and was skipped: {}", id, e);
            self.note_skipped(&id, &e.to_string());
            self.queue.clear_current()?;
            return Ok(Advance::Done);
        }
        debug!("Applied update for {}", id);

        if !item.hand_off {
            self.queue.clear_current()?;
            return Ok(Advance::Done);
        }

        info!("Handing off {}", id);
        self.queue.set_halt()?;
        let result = self
            .hand_off
            .enhance(&id)
            .and_then(|_| self.hand_off.hand_off(&id));
        self.queue.clear_halt()?;
        self.queue.clear_current()?;

        match result {
            Ok(()) => {
                info!("Hand-off of {} complete", id);
                Ok(Advance::Done)
            }
            Err(e) => {
                error!("Hand-off of {} failed: {}", id, e);
                Ok(Advance::HandOffFailed(e))
            }
        }
    }

    fn note_skipped(&self, id: &str, reason: &str) {
        let Some(dir) = &self.status_dir else {
            return;
        };
        let noted = JobStatus::open(dir, id)
            .and_then(|mut status| status.record_progress(format!("update skipped: {}", reason)));
        if let Err(e) = noted {
            warn!("Could not record skipped update for {}: {}", id, e);
        }
    }
}
