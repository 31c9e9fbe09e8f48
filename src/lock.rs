//! Named cross-process locks
//!
//! Callers lock by key through [`NamedLock`], so the file-based implementation
//! here can be swapped for a lock service without touching call sites.

use crate::error::{BagError, IoContext, Result};
use fs4::FileExt;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Mutual exclusion by name
pub trait NamedLock: Send + Sync {
    /// Block until `key` is held by the calling thread, or fail after a timeout
    fn acquire(&self, key: &str) -> Result<()>;

    /// Release one acquisition of `key` by the calling thread
    fn release(&self, key: &str) -> Result<()>;
}

/// A held lock, released when dropped
pub struct HeldLock<'a> {
    lock: &'a dyn NamedLock,
    key: String,
}

impl std::fmt::Debug for HeldLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeldLock").field("key", &self.key).finish()
    }
}

/// Acquire `key` and hold it for the guard's lifetime
pub fn hold<'a>(lock: &'a dyn NamedLock, key: &str) -> Result<HeldLock<'a>> {
    lock.acquire(key)?;
    Ok(HeldLock {
        lock,
        key: key.to_string(),
    })
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release(&self.key) {
            warn!("Releasing lock '{}' failed: {}", self.key, e);
        }
    }
}

struct Slot {
    owner: ThreadId,
    depth: usize,
    /// None while the owner is still waiting for the file lock
    file: Option<File>,
}

/// `fs4` advisory locks on `<dir>/<key>.lock`
///
/// Re-entrant per thread. Threads of one process queue on an in-memory slot
/// before contending for the file, and other processes are excluded by the
/// file lock itself.
pub struct FileLockManager {
    dir: PathBuf,
    timeout: Duration,
    retry: Duration,
    held: Mutex<HashMap<String, Slot>>,
    released: Condvar,
}

impl FileLockManager {
    pub fn new(dir: impl AsRef<Path>, timeout: Duration, retry: Duration) -> Self {
        FileLockManager {
            dir: dir.as_ref().to_path_buf(),
            timeout,
            retry: retry.max(Duration::from_millis(1)),
            held: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    pub fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", key))
    }

    fn timed_out(&self, key: &str) -> BagError {
        BagError::State(format!(
            "timed out after {:?} waiting for lock '{}'",
            self.timeout, key
        ))
    }

    fn lock_file(&self, key: &str, deadline: Instant) -> Result<File> {
        fs::create_dir_all(&self.dir).ctx("create lock directory", &self.dir)?;
        let path = self.lock_path(key);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .ctx("open lock file", &path)?;

        let mut contended = false;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(file),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if !contended {
                        debug!("Lock '{}' is held by another process; waiting", key);
                        contended = true;
                    }
                    if Instant::now() >= deadline {
                        return Err(self.timed_out(key));
                    }
                    thread::sleep(self.retry);
                }
                Err(e) => return Err(BagError::io("lock", &path, e)),
            }
        }
    }
}

fn check_key(key: &str) -> Result<()> {
    let ok = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if ok {
        Ok(())
    } else {
        Err(BagError::invalid(format!("'{}' is not a usable lock name", key)))
    }
}

impl NamedLock for FileLockManager {
    fn acquire(&self, key: &str) -> Result<()> {
        check_key(key)?;
        let me = thread::current().id();
        let deadline = Instant::now() + self.timeout;

        {
            let mut held = self.held.lock();
            loop {
                match held.get(key).map(|slot| slot.owner) {
                    Some(owner) if owner == me => {
                        if let Some(slot) = held.get_mut(key) {
                            slot.depth += 1;
                        }
                        return Ok(());
                    }
                    Some(_) => {
                        if self.released.wait_until(&mut held, deadline).timed_out()
                            && held.contains_key(key)
                        {
                            return Err(self.timed_out(key));
                        }
                    }
                    None => {
                        held.insert(
                            key.to_string(),
                            Slot {
                                owner: me,
                                depth: 1,
                                file: None,
                            },
                        );
                        break;
                    }
                }
            }
        }

        match self.lock_file(key, deadline) {
            Ok(file) => {
                if let Some(slot) = self.held.lock().get_mut(key) {
                    slot.file = Some(file);
                }
                Ok(())
            }
            Err(e) => {
                self.held.lock().remove(key);
                self.released.notify_all();
                Err(e)
            }
        }
    }

    fn release(&self, key: &str) -> Result<()> {
        let me = thread::current().id();
        let mut held = self.held.lock();
        let remaining = match held.get_mut(key) {
            Some(slot) if slot.owner == me => {
                slot.depth -= 1;
                slot.depth
            }
            Some(_) => {
                return Err(BagError::State(format!(
                    "lock '{}' is held by another thread",
                    key
                )))
            }
            None => return Err(BagError::State(format!("lock '{}' is not held", key))),
        };
        if remaining > 0 {
            return Ok(());
        }

        let unlocked = match held.remove(key).and_then(|s| s.file) {
            Some(file) => FileExt::unlock(&file).ctx("unlock", self.lock_path(key)),
            None => Ok(()),
        };
        drop(held);
        self.released.notify_all();
        unlocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, timeout_ms: u64) -> FileLockManager {
        FileLockManager::new(
            dir.path(),
            Duration::from_millis(timeout_ms),
            Duration::from_millis(5),
        )
    }

    #[test]
    fn test_reentrant_on_same_thread() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, 200);
        let outer = hold(&locks, "job1")?;
        {
            let _inner = hold(&locks, "job1")?;
        }
        drop(outer);
        assert!(locks.release("job1").is_err());
        Ok(())
    }

    #[test]
    fn test_other_thread_times_out() {
        let dir = TempDir::new().unwrap();
        let locks = Arc::new(manager(&dir, 50));
        let _held = hold(&*locks, "job1").unwrap();

        let contender = Arc::clone(&locks);
        let result = thread::spawn(move || contender.acquire("job1")).join().unwrap();
        assert!(matches!(result, Err(BagError::State(_))));
    }

    #[test]
    fn test_waiter_gets_lock_after_release() {
        let dir = TempDir::new().unwrap();
        let locks = Arc::new(manager(&dir, 5_000));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    for _ in 0..5 {
                        let _guard = hold(&*locks, "shared").unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(1));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_separate_managers_exclude_each_other() {
        let dir = TempDir::new().unwrap();
        let first = manager(&dir, 50);
        let second = manager(&dir, 50);
        let _held = hold(&first, "job1").unwrap();
        // a second manager opens its own descriptor, like another process would
        assert!(second.acquire("job1").is_err());
    }

    #[test]
    fn test_release_by_other_thread_rejected() {
        let dir = TempDir::new().unwrap();
        let locks = Arc::new(manager(&dir, 50));
        locks.acquire("job1").unwrap();
        let other = Arc::clone(&locks);
        let result = thread::spawn(move || other.release("job1")).join().unwrap();
        assert!(result.is_err());
        locks.release("job1").unwrap();
    }

    #[test]
    fn test_bad_key_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(manager(&dir, 50).acquire("../escape").is_err());
    }
}
