//! Persisted, lock-guarded job status
//!
//! Each job id has one JSON document at `<status_dir>/<id>.json`:
//!
//! ```json
//! {"sys": {...}, "user": {"id", "state", "message", "start_time", "started",
//!  "update_time", "updated"}, "history": [...]}
//! ```
//!
//! Writers replace the document atomically while holding an exclusive lock on
//! `<id>.json.lock`; readers hold a shared lock, so no process ever sees a
//! partially written record.

use crate::error::{BagError, IoContext, Result};
use chrono::{SecondsFormat, Utc};
use fs4::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    NotFound,
    Ready,
    NotReady,
    Pending,
    InProgress,
    Successful,
    Failed,
    Forgotten,
    Conflict,
}

impl JobState {
    pub const ALL: [JobState; 9] = [
        JobState::NotFound,
        JobState::Ready,
        JobState::NotReady,
        JobState::Pending,
        JobState::InProgress,
        JobState::Successful,
        JobState::Failed,
        JobState::Forgotten,
        JobState::Conflict,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            JobState::NotFound => "NOT_FOUND",
            JobState::Ready => "READY",
            JobState::NotReady => "NOT_READY",
            JobState::Pending => "PENDING",
            JobState::InProgress => "IN_PROGRESS",
            JobState::Successful => "SUCCESSFUL",
            JobState::Failed => "FAILED",
            JobState::Forgotten => "FORGOTTEN",
            JobState::Conflict => "CONFLICT",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for JobState {
    type Err = BagError;

    /// Accepts `IN_PROGRESS`, `in progress` and `in-progress` alike
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        JobState::ALL
            .iter()
            .copied()
            .find(|state| state.label() == normalized)
            .ok_or_else(|| {
                BagError::invalid(format!(
                    "unknown job state '{}' (expected one of {})",
                    s,
                    JobState::ALL.map(|st| st.label()).join(", ")
                ))
            })
    }
}

/// The user-visible part of a status record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub id: String,
    pub state: JobState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub started: Option<String>,
    #[serde(default)]
    pub update_time: Option<f64>,
    #[serde(default)]
    pub updated: Option<String>,
}

impl StatusSnapshot {
    fn initial(id: &str) -> Self {
        StatusSnapshot {
            id: id.to_string(),
            state: JobState::Forgotten,
            message: String::new(),
            start_time: None,
            started: None,
            update_time: None,
            updated: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusDocument {
    #[serde(default)]
    sys: Map<String, Value>,
    user: StatusSnapshot,
    #[serde(default)]
    history: Vec<StatusSnapshot>,
}

/// What [`JobStatus::export`] hands to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusExport {
    #[serde(flatten)]
    pub current: StatusSnapshot,
    pub history: Vec<StatusSnapshot>,
    /// True once the job has ever completed a cycle or succeeded now
    pub published: bool,
}

fn now() -> (f64, String) {
    let now = Utc::now();
    (
        now.timestamp_millis() as f64 / 1000.0,
        now.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

fn check_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if ok {
        Ok(())
    } else {
        Err(BagError::invalid(format!("'{}' is not a usable job id", id)))
    }
}

/// Advisory lock on a status record, released on drop
struct RecordLock {
    file: File,
    path: PathBuf,
}

impl RecordLock {
    fn open(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ctx("create status directory", parent)?;
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .ctx("open status lock", path)
    }

    fn exclusive(path: &Path) -> Result<Self> {
        let file = Self::open(path)?;
        FileExt::lock_exclusive(&file).ctx("lock status record", path)?;
        Ok(RecordLock {
            file,
            path: path.to_path_buf(),
        })
    }

    fn shared(path: &Path) -> Result<Self> {
        let file = Self::open(path)?;
        FileExt::lock_shared(&file).ctx("share-lock status record", path)?;
        Ok(RecordLock {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to unlock {:?}: {}", self.path, e);
        }
    }
}

fn record_paths(status_dir: &Path, id: &str) -> (PathBuf, PathBuf) {
    let path = status_dir.join(format!("{}.json", id));
    let lock = status_dir.join(format!("{}.json.lock", id));
    (path, lock)
}

fn load(path: &Path, lock_path: &Path) -> Result<Option<StatusDocument>> {
    let _lock = RecordLock::shared(lock_path)?;
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path).ctx("read status record", path)?;
    Ok(Some(serde_json::from_str(&text)?))
}

/// One job's status, backed by its record on disk
pub struct JobStatus {
    path: PathBuf,
    lock_path: PathBuf,
    doc: StatusDocument,
    persisted: bool,
}

impl JobStatus {
    /// Load the record for `id`, or start from `FORGOTTEN` if none exists
    pub fn open(status_dir: impl AsRef<Path>, id: &str) -> Result<Self> {
        check_id(id)?;
        let (path, lock_path) = record_paths(status_dir.as_ref(), id);
        let stored = load(&path, &lock_path)?;
        let persisted = stored.is_some();
        let doc = stored.unwrap_or_else(|| StatusDocument {
            sys: Map::new(),
            user: StatusSnapshot::initial(id),
            history: Vec::new(),
        });
        Ok(JobStatus {
            path,
            lock_path,
            doc,
            persisted,
        })
    }

    pub fn id(&self) -> &str {
        &self.doc.user.id
    }

    pub fn state(&self) -> JobState {
        self.doc.user.state
    }

    pub fn message(&self) -> &str {
        &self.doc.user.message
    }

    pub fn snapshot(&self) -> &StatusSnapshot {
        &self.doc.user
    }

    pub fn history(&self) -> &[StatusSnapshot] {
        &self.doc.history
    }

    pub fn sys(&self) -> &Map<String, Value> {
        &self.doc.sys
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// Reload from disk, picking up changes made by other processes
    pub fn refresh(&mut self) -> Result<()> {
        match load(&self.path, &self.lock_path)? {
            Some(doc) => {
                self.doc = doc;
                self.persisted = true;
            }
            None => {
                let id = self.id().to_string();
                self.doc.user = StatusSnapshot::initial(&id);
                self.doc.history.clear();
                self.persisted = false;
            }
        }
        Ok(())
    }

    fn persist(&mut self) -> Result<()> {
        let _lock = RecordLock::exclusive(&self.lock_path)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.doc)?).ctx("write status record", &tmp)?;
        fs::rename(&tmp, &self.path).ctx("replace status record", &self.path)?;
        self.persisted = true;
        debug!("Job {} is {}: {}", self.id(), self.state(), self.message());
        Ok(())
    }

    fn stamp(&mut self) {
        let (time, text) = now();
        self.doc.user.update_time = Some(time);
        self.doc.user.updated = Some(text);
    }

    /// Begin a new cycle in `PENDING`
    ///
    /// A previously persisted snapshot is pushed onto the history first.
    pub fn reset(&mut self, message: impl Into<String>) -> Result<()> {
        if self.persisted {
            let previous = self.doc.user.clone();
            self.doc.history.push(previous);
        }
        let id = self.id().to_string();
        self.doc.user = StatusSnapshot::initial(&id);
        self.doc.user.state = JobState::Pending;
        self.doc.user.message = message.into();
        self.stamp();
        self.persist()
    }

    /// Record the start time and move to `IN_PROGRESS`
    pub fn start(&mut self, message: impl Into<String>) -> Result<()> {
        let (time, text) = now();
        self.doc.user.start_time = Some(time);
        self.doc.user.started = Some(text);
        self.doc.user.state = JobState::InProgress;
        self.doc.user.message = message.into();
        self.stamp();
        self.persist()
    }

    pub fn update(&mut self, state: JobState, message: impl Into<String>) -> Result<()> {
        self.update_with(state, message, true)
    }

    /// Transition to `state`; with `persist` false only the in-memory copy changes
    pub fn update_with(
        &mut self,
        state: JobState,
        message: impl Into<String>,
        persist: bool,
    ) -> Result<()> {
        self.doc.user.state = state;
        self.doc.user.message = message.into();
        self.stamp();
        if persist {
            self.persist()
        } else {
            Ok(())
        }
    }

    /// Transition by label; an unknown label fails before anything changes
    pub fn update_label(&mut self, label: &str, message: impl Into<String>) -> Result<()> {
        let state: JobState = label.parse()?;
        self.update(state, message)
    }

    /// Replace the message without changing state
    pub fn record_progress(&mut self, message: impl Into<String>) -> Result<()> {
        self.doc.user.message = message.into();
        self.stamp();
        self.persist()
    }

    pub fn set_sys(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        self.doc.sys.insert(key.into(), value);
        self.persist()
    }

    pub fn export(&self) -> StatusExport {
        StatusExport {
            current: self.doc.user.clone(),
            history: self.doc.history.clone(),
            published: !self.doc.history.is_empty() || self.doc.user.state == JobState::Successful,
        }
    }

    /// Delete the backing record; the job reads as `FORGOTTEN` afterwards
    pub fn forget(&mut self) -> Result<()> {
        {
            let _lock = RecordLock::exclusive(&self.lock_path)?;
            if self.path.exists() {
                fs::remove_file(&self.path).ctx("remove status record", &self.path)?;
            }
        }
        let id = self.id().to_string();
        self.doc = StatusDocument {
            sys: Map::new(),
            user: StatusSnapshot::initial(&id),
            history: Vec::new(),
        };
        self.persisted = false;
        debug!("Forgot job {}", id);
        Ok(())
    }
}

/// Read-only view of a job's current status
pub fn read_status(status_dir: impl AsRef<Path>, id: &str) -> Result<StatusExport> {
    Ok(JobStatus::open(status_dir, id)?.export())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_state_labels() {
        assert_eq!("IN_PROGRESS".parse::<JobState>().unwrap(), JobState::InProgress);
        assert_eq!("in progress".parse::<JobState>().unwrap(), JobState::InProgress);
        assert_eq!("not-ready".parse::<JobState>().unwrap(), JobState::NotReady);
        assert!("DONE".parse::<JobState>().is_err());
        assert_eq!(
            serde_json::to_value(JobState::NotFound).unwrap(),
            Value::String("NOT_FOUND".into())
        );
    }

    #[test]
    fn test_unseen_job_is_forgotten() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let status = JobStatus::open(dir.path(), "job1")?;
        assert_eq!(status.state(), JobState::Forgotten);
        assert!(!status.is_persisted());
        assert!(!status.export().published);
        assert!(!dir.path().join("job1.json").exists());
        Ok(())
    }

    #[test]
    fn test_reset_keeps_history_only_when_persisted() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut status = JobStatus::open(dir.path(), "job1")?;
        status.reset("queued")?;
        assert!(status.history().is_empty());

        status.update(JobState::Failed, "boom")?;
        status.reset("again")?;
        assert_eq!(status.history().len(), 1);
        assert_eq!(status.history()[0].state, JobState::Failed);
        assert_eq!(status.state(), JobState::Pending);
        assert!(status.export().published);
        Ok(())
    }

    #[test]
    fn test_start_records_times() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut status = JobStatus::open(dir.path(), "job1")?;
        status.start("working")?;
        let snap = status.snapshot();
        assert!(snap.start_time.is_some());
        assert!(snap.started.as_deref().unwrap().ends_with('Z'));

        let other = JobStatus::open(dir.path(), "job1")?;
        assert_eq!(other.state(), JobState::InProgress);
        assert_eq!(other.message(), "working");
        Ok(())
    }

    #[test]
    fn test_update_without_persist() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut status = JobStatus::open(dir.path(), "job1")?;
        status.reset("queued")?;
        status.update_with(JobState::Failed, "local only", false)?;
        assert_eq!(status.state(), JobState::Failed);

        status.refresh()?;
        assert_eq!(status.state(), JobState::Pending);
        Ok(())
    }

    #[test]
    fn test_unknown_label_leaves_record_unchanged() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut status = JobStatus::open(dir.path(), "job1")?;
        status.start("working")?;
        let before = fs::read(dir.path().join("job1.json")).unwrap();

        let err = status.update_label("HALF_DONE", "nope").unwrap_err();
        assert!(err.to_string().contains("HALF_DONE"));
        assert_eq!(fs::read(dir.path().join("job1.json")).unwrap(), before);
        assert_eq!(status.state(), JobState::InProgress);
        Ok(())
    }

    #[test]
    fn test_sys_and_forget() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut status = JobStatus::open(dir.path(), "job1")?;
        status.set_sys("bag", Value::String("mds2-1".into()))?;
        assert_eq!(JobStatus::open(dir.path(), "job1")?.sys()["bag"], "mds2-1");

        status.forget()?;
        assert_eq!(status.state(), JobState::Forgotten);
        assert_eq!(read_status(dir.path(), "job1")?.current.state, JobState::Forgotten);
        Ok(())
    }

    #[test]
    fn test_bad_ids_rejected() {
        let dir = TempDir::new().unwrap();
        for id in ["", "../x", ".hidden", "a/b"] {
            assert!(JobStatus::open(dir.path(), id).is_err(), "{}", id);
        }
    }

    #[test]
    fn test_export_serializes_flat() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut status = JobStatus::open(dir.path(), "job1")?;
        status.update(JobState::Successful, "done")?;
        let value = serde_json::to_value(status.export())?;
        assert_eq!(value["state"], "SUCCESSFUL");
        assert_eq!(value["published"], true);
        assert_eq!(value["id"], "job1");
        Ok(())
    }
}
