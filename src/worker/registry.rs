use super::bagger::BaggingWorker;
use crate::error::{BagError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[derive(Default)]
struct CompletionState {
    finished: bool,
    error: Option<BagError>,
}

/// Outcome of one worker run, waited on by callers
#[derive(Default)]
pub struct Completion {
    state: Mutex<CompletionState>,
    done: Condvar,
}

impl Completion {
    fn finish(&self, result: Result<()>) {
        let mut state = self.state.lock();
        state.finished = true;
        state.error = result.err();
        self.done.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Wait for the run to end; the first waiter receives its error
    ///
    /// Returns false if `timeout` passed first.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while !state.finished {
            match deadline {
                Some(deadline) => {
                    if self.done.wait_until(&mut state, deadline).timed_out() && !state.finished {
                        return Ok(false);
                    }
                }
                None => self.done.wait(&mut state),
            }
        }
        match state.error.take() {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }
}

#[derive(Default)]
struct Workers {
    active: HashMap<String, Arc<Completion>>,
    last: HashMap<String, Arc<Completion>>,
}

/// At most one live worker per job id
///
/// A worker re-checks its queue under the registry lock before it exits, so
/// an item queued just before a `launch` that found the worker still
/// registered is never left behind.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: Mutex<Workers>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_working(&self, id: &str) -> bool {
        self.workers.lock().active.contains_key(id)
    }

    /// Ids whose last run ended in an error nobody has collected yet
    pub fn unclaimed_failures(&self) -> usize {
        let workers = self.workers.lock();
        workers
            .last
            .keys()
            .filter(|id| !workers.active.contains_key(*id))
            .count()
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.lock().active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start `worker` on its own thread unless one is already running
    ///
    /// Returns false (and drops `worker`) when the id already has a live worker.
    pub fn launch(self: &Arc<Self>, worker: BaggingWorker) -> Result<bool> {
        let id = worker.id().to_string();
        let completion = Arc::new(Completion::default());
        {
            let mut workers = self.workers.lock();
            if workers.active.contains_key(&id) {
                debug!("Worker for {} already running", id);
                return Ok(false);
            }
            workers.active.insert(id.clone(), Arc::clone(&completion));
            workers.last.insert(id.clone(), Arc::clone(&completion));
        }

        let registry = Arc::clone(self);
        let thread_id = id.clone();
        let spawned = thread::Builder::new()
            .name(format!("bagger-{}", id))
            .spawn(move || registry.drive(&thread_id, worker, completion));

        if let Err(e) = spawned {
            let mut workers = self.workers.lock();
            workers.active.remove(&id);
            workers.last.remove(&id);
            return Err(BagError::State(format!("cannot start worker for {}: {}", id, e)));
        }
        Ok(true)
    }

    fn drive(&self, id: &str, worker: BaggingWorker, completion: Arc<Completion>) {
        let mut failure: Option<BagError> = None;
        loop {
            let stalled = match worker.run() {
                Ok(()) => false,
                Err(e) => {
                    error!("Worker for {} stopped: {}", id, e);
                    let stalled = e.is_state_error();
                    failure.get_or_insert(e);
                    stalled
                }
            };
            let mut workers = self.workers.lock();
            if !stalled {
                match worker.has_pending() {
                    Ok(true) => {
                        drop(workers);
                        debug!("Worker for {} found late arrivals", id);
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => error!("Worker for {} could not re-check its queue: {}", id, e),
                }
            }
            workers.active.remove(id);
            // A clean run leaves nothing for a waiter to collect
            if failure.is_none()
                && workers
                    .last
                    .get(id)
                    .map_or(false, |c| Arc::ptr_eq(c, &completion))
            {
                workers.last.remove(id);
            }
            drop(workers);
            completion.finish(failure.map_or(Ok(()), Err));
            return;
        }
    }

    /// Wait for the most recent worker of `id` to stop
    ///
    /// Ok(true) once it has stopped (or none was ever started), Ok(false) on
    /// timeout, and Err with the hand-off failure that stopped it, reported once.
    pub fn wait_for_completion(&self, id: &str, timeout: Option<Duration>) -> Result<bool> {
        let completion = match self.workers.lock().last.get(id) {
            Some(c) => Arc::clone(c),
            None => return Ok(true),
        };
        let outcome = completion.wait(timeout);
        if !matches!(outcome, Ok(false)) {
            let mut workers = self.workers.lock();
            if workers
                .last
                .get(id)
                .map_or(false, |c| Arc::ptr_eq(c, &completion))
            {
                workers.last.remove(id);
            }
        }
        outcome
    }
}
