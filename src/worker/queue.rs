//! File-backed update queue for one job
//!
//! Layout under `<queue_dir>/<id>/`: `current.json`, `next.json`,
//! `preserve.json` and the `halt` marker. Every access holds the job's local
//! re-entrant lock and then its named lock, and every slot write is an atomic
//! replace, so concurrent writers and readers never see a partial slot.

use crate::error::{IoContext, Result};
use crate::lock::{hold, NamedLock};
use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub const HALT_FILE: &str = "halt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Current,
    Next,
    Preserve,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::Current, Slot::Next, Slot::Preserve];

    pub fn file_name(&self) -> &'static str {
        match self {
            Slot::Current => "current.json",
            Slot::Next => "next.json",
            Slot::Preserve => "preserve.json",
        }
    }
}

/// One queued update; `hand_off` marks the item that triggers preservation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub payload: Value,
    #[serde(rename = "_handoff", default)]
    pub hand_off: bool,
}

impl QueueItem {
    pub fn update(payload: Value) -> Self {
        QueueItem {
            payload,
            hand_off: false,
        }
    }

    pub fn hand_off(payload: Value) -> Self {
        QueueItem {
            payload,
            hand_off: true,
        }
    }
}

pub struct UpdateQueue {
    id: String,
    dir: PathBuf,
    locks: Arc<dyn NamedLock>,
    local: Arc<ReentrantMutex<()>>,
}

impl UpdateQueue {
    pub fn new(queue_dir: impl AsRef<Path>, id: &str, locks: Arc<dyn NamedLock>) -> Self {
        UpdateQueue {
            id: id.to_string(),
            dir: queue_dir.as_ref().join(id),
            locks,
            local: Arc::new(ReentrantMutex::new(())),
        }
    }

    /// Share a process-local lock with other handles on the same job
    pub fn with_local_lock(mut self, local: Arc<ReentrantMutex<()>>) -> Self {
        self.local = local;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn guarded<T>(&self, f: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
        let _local = self.local.lock();
        let _named = hold(self.locks.as_ref(), &self.id)?;
        f(&self.dir)
    }

    fn read_slot(dir: &Path, slot: Slot) -> Result<Option<QueueItem>> {
        let path = dir.join(slot.file_name());
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path).ctx("read queue slot", &path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn write_slot(dir: &Path, slot: Slot, item: &QueueItem) -> Result<()> {
        fs::create_dir_all(dir).ctx("create queue directory", dir)?;
        let path = dir.join(slot.file_name());
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(item)?).ctx("write queue slot", &tmp)?;
        fs::rename(&tmp, &path).ctx("replace queue slot", &path)
    }

    fn remove_slot(dir: &Path, slot: Slot) -> Result<()> {
        let path = dir.join(slot.file_name());
        if path.exists() {
            fs::remove_file(&path).ctx("remove queue slot", &path)?;
        }
        Ok(())
    }

    /// Put an update in `next`, replacing whatever was waiting there
    pub fn queue_update(&self, payload: Value) -> Result<()> {
        self.guarded(|dir| Self::write_slot(dir, Slot::Next, &QueueItem::update(payload)))?;
        debug!("Queued update for {}", self.id);
        Ok(())
    }

    /// Tag a hand-off item and place it in `preserve`
    ///
    /// With `as_update`, its payload is the most authoritative pending update:
    /// `next` (which is consumed), else `preserve`, else `current`. Otherwise
    /// the hand-off carries an empty update.
    pub fn mark_for_hand_off(&self, as_update: bool) -> Result<()> {
        self.guarded(|dir| {
            let payload = if as_update {
                if let Some(next) = Self::read_slot(dir, Slot::Next)? {
                    Self::remove_slot(dir, Slot::Next)?;
                    next.payload
                } else if let Some(preserve) = Self::read_slot(dir, Slot::Preserve)? {
                    preserve.payload
                } else if let Some(current) = Self::read_slot(dir, Slot::Current)? {
                    current.payload
                } else {
                    json!({})
                }
            } else {
                json!({})
            };
            Self::write_slot(dir, Slot::Preserve, &QueueItem::hand_off(payload))
        })?;
        debug!("Marked {} for hand-off", self.id);
        Ok(())
    }

    pub fn is_populated(&self) -> Result<bool> {
        self.guarded(|dir| Ok(Slot::ALL.iter().any(|s| dir.join(s.file_name()).exists())))
    }

    pub fn has(&self, slot: Slot) -> Result<bool> {
        self.guarded(|dir| Ok(dir.join(slot.file_name()).exists()))
    }

    pub fn peek(&self, slot: Slot) -> Result<Option<QueueItem>> {
        self.guarded(|dir| Self::read_slot(dir, slot))
    }

    pub fn is_halted(&self) -> Result<bool> {
        self.guarded(|dir| Ok(dir.join(HALT_FILE).exists()))
    }

    pub fn set_halt(&self) -> Result<()> {
        self.guarded(|dir| {
            fs::create_dir_all(dir).ctx("create queue directory", dir)?;
            let path = dir.join(HALT_FILE);
            fs::write(&path, b"").ctx("set halt", &path)
        })
    }

    pub fn clear_halt(&self) -> Result<()> {
        self.guarded(|dir| {
            let path = dir.join(HALT_FILE);
            if path.exists() {
                fs::remove_file(&path).ctx("clear halt", &path)?;
            }
            Ok(())
        })
    }

    /// Move `preserve` (else `next`) into an empty `current` unless halted
    pub fn promote(&self) -> Result<Option<Slot>> {
        let promoted = self.guarded(|dir| {
            if dir.join(HALT_FILE).exists() || dir.join(Slot::Current.file_name()).exists() {
                return Ok(None);
            }
            for slot in [Slot::Preserve, Slot::Next] {
                let from = dir.join(slot.file_name());
                if from.exists() {
                    let to = dir.join(Slot::Current.file_name());
                    fs::rename(&from, &to).ctx("promote queue slot", &to)?;
                    return Ok(Some(slot));
                }
            }
            Ok(None)
        })?;
        if let Some(slot) = promoted {
            debug!("Promoted {:?} to current for {}", slot, self.id);
        }
        Ok(promoted)
    }

    pub fn load_current(&self) -> Result<Option<QueueItem>> {
        self.peek(Slot::Current)
    }

    pub fn clear_current(&self) -> Result<()> {
        self.guarded(|dir| Self::remove_slot(dir, Slot::Current))
    }

    /// Drop every slot and the halt marker
    pub fn clear(&self) -> Result<()> {
        self.guarded(|dir| {
            for slot in Slot::ALL {
                Self::remove_slot(dir, slot)?;
            }
            let halt = dir.join(HALT_FILE);
            if halt.exists() {
                fs::remove_file(&halt).ctx("clear halt", &halt)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::FileLockManager;
    use std::time::Duration;
    use tempfile::TempDir;

    fn queue(dir: &TempDir) -> UpdateQueue {
        let locks = Arc::new(FileLockManager::new(
            dir.path().join("locks"),
            Duration::from_secs(5),
            Duration::from_millis(5),
        ));
        UpdateQueue::new(dir.path().join("queue"), "job1", locks)
    }

    #[test]
    fn test_queue_update_overwrites_next() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        q.queue_update(json!({"title": "first"}))?;
        q.queue_update(json!({"title": "second"}))?;
        assert_eq!(q.peek(Slot::Next)?.unwrap().payload["title"], "second");
        Ok(())
    }

    #[test]
    fn test_preserve_preempts_next() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        q.queue_update(json!({"title": "stale"}))?;
        q.mark_for_hand_off(false)?;

        assert_eq!(q.promote()?, Some(Slot::Preserve));
        let item = q.load_current()?.unwrap();
        assert!(item.hand_off);
        assert_eq!(item.payload, json!({}));
        // current is occupied, so nothing else moves
        assert_eq!(q.promote()?, None);
        assert!(q.has(Slot::Next)?);
        Ok(())
    }

    #[test]
    fn test_hand_off_consumes_next_as_update() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        q.queue_update(json!({"title": "final"}))?;
        q.mark_for_hand_off(true)?;

        assert!(!q.has(Slot::Next)?);
        let item = q.peek(Slot::Preserve)?.unwrap();
        assert!(item.hand_off);
        assert_eq!(item.payload["title"], "final");
        Ok(())
    }

    #[test]
    fn test_hand_off_falls_back_to_current() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        q.queue_update(json!({"title": "in flight"}))?;
        q.promote()?;
        q.mark_for_hand_off(true)?;
        assert_eq!(q.peek(Slot::Preserve)?.unwrap().payload["title"], "in flight");
        assert!(q.has(Slot::Current)?);
        Ok(())
    }

    #[test]
    fn test_halt_blocks_promotion() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        q.queue_update(json!({}))?;
        q.set_halt()?;
        assert_eq!(q.promote()?, None);
        q.clear_halt()?;
        assert_eq!(q.promote()?, Some(Slot::Next));
        q.clear_current()?;
        assert!(!q.is_populated()?);
        Ok(())
    }

    #[test]
    fn test_slot_document_shape() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        q.mark_for_hand_off(false)?;
        let text = fs::read_to_string(q.dir().join("preserve.json")).unwrap();
        let doc: Value = serde_json::from_str(&text)?;
        assert_eq!(doc, json!({"payload": {}, "_handoff": true}));
        Ok(())
    }
}
