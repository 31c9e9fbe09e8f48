//! The bagging service: queues, workers and status behind one handle

use crate::config::BaggerConfig;
use crate::error::Result;
use crate::external::{Deliverer, DirectoryDeliverer, MetadataValidator, RequiredFields};
use crate::ident::{CheckCharMinter, IdMinter};
use crate::lock::{FileLockManager, NamedLock};
use crate::status::{read_status, StatusExport};
use crate::worker::{
    BaggingWorker, HandOff, PackageUpdater, Preserver, ReadModel, UpdateApplier, UpdateQueue,
    WorkerRegistry,
};
use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Owns the configuration, locks, worker registry and collaborators
///
/// # Examples
///
/// ```rust,no_run
/// use bagsmith::{BaggerConfig, BaggingService};
/// use serde_json::json;
/// use std::time::Duration;
///
/// # fn main() -> bagsmith::Result<()> {
/// let service = BaggingService::new(BaggerConfig::for_root("/var/bagsmith"))?;
/// service.submit("mds2-2106", json!({"title": "Trial data"}))?;
/// service.mark_for_hand_off("mds2-2106", false)?;
/// service.launch("mds2-2106")?;
/// service.wait_for_completion("mds2-2106", Some(Duration::from_secs(600)))?;
/// println!("{:?}", service.status("mds2-2106")?.current.state);
/// # Ok(())
/// # }
/// ```
pub struct BaggingService {
    config: BaggerConfig,
    locks: Arc<dyn NamedLock>,
    local_locks: Mutex<HashMap<String, Arc<ReentrantMutex<()>>>>,
    registry: Arc<WorkerRegistry>,
    applier: Arc<dyn UpdateApplier>,
    deliverer: Arc<dyn Deliverer>,
    minter: Option<Arc<dyn IdMinter>>,
    validator: Option<Arc<dyn MetadataValidator>>,
    hand_off: Arc<dyn HandOff>,
    read_model: Arc<ReadModel>,
}

impl BaggingService {
    /// Service with the default updater, preserver and directory deliverer
    ///
    /// The preserver mints identifiers when `config.minter` is set and
    /// validates `config.required_fields` before finalizing.
    pub fn new(config: BaggerConfig) -> Result<Self> {
        config.validate()?;
        let read_model = Arc::new(ReadModel::from_config(&config));
        let applier = Arc::new(
            PackageUpdater::new(&config.working_dir)
                .with_link_fallback(config.link_fallback)
                .with_read_model(Arc::clone(&read_model)),
        );
        let minter = match &config.minter {
            Some(settings) => {
                let mut minter = CheckCharMinter::new(&settings.prefix, &settings.shoulder)?;
                if let Some(state) = &settings.state_file {
                    minter = minter.with_state_file(state);
                }
                Some(Arc::new(minter) as Arc<dyn IdMinter>)
            }
            None => None,
        };
        let validator = if config.required_fields.is_empty() {
            None
        } else {
            Some(Arc::new(RequiredFields::new(config.required_fields.iter()))
                as Arc<dyn MetadataValidator>)
        };
        let deliverer: Arc<dyn Deliverer> = Arc::new(DirectoryDeliverer::new(&config.store_dir));
        let hand_off = Self::preserver(&config, &deliverer, &minter, &validator);
        let locks = Arc::new(FileLockManager::new(
            config.lock_dir(),
            config.lock_timeout(),
            config.lock_retry(),
        ));

        info!("Bagging service rooted at {:?}", config.working_dir);
        Ok(BaggingService {
            config,
            locks,
            local_locks: Mutex::new(HashMap::new()),
            registry: Arc::new(WorkerRegistry::new()),
            applier,
            deliverer,
            minter,
            validator,
            hand_off,
            read_model,
        })
    }

    fn preserver(
        config: &BaggerConfig,
        deliverer: &Arc<dyn Deliverer>,
        minter: &Option<Arc<dyn IdMinter>>,
        validator: &Option<Arc<dyn MetadataValidator>>,
    ) -> Arc<dyn HandOff> {
        let mut preserver = Preserver::new(config.clone(), Arc::clone(deliverer));
        if let Some(minter) = minter {
            preserver = preserver.with_minter(Arc::clone(minter));
        }
        if let Some(validator) = validator {
            preserver = preserver.with_validator(Arc::clone(validator));
        }
        Arc::new(preserver)
    }

    fn rebuild_preserver(mut self) -> Self {
        self.hand_off = Self::preserver(&self.config, &self.deliverer, &self.minter, &self.validator);
        self
    }

    pub fn with_applier(mut self, applier: Arc<dyn UpdateApplier>) -> Self {
        self.applier = applier;
        self
    }

    /// Replace the preserver entirely
    ///
    /// A later `with_deliverer`, `with_minter` or `with_validator` restores
    /// the built-in preserver.
    pub fn with_hand_off(mut self, hand_off: Arc<dyn HandOff>) -> Self {
        self.hand_off = hand_off;
        self
    }

    pub fn with_deliverer(mut self, deliverer: Arc<dyn Deliverer>) -> Self {
        self.deliverer = deliverer;
        self.rebuild_preserver()
    }

    pub fn with_minter(mut self, minter: Arc<dyn IdMinter>) -> Self {
        self.minter = Some(minter);
        self.rebuild_preserver()
    }

    pub fn with_validator(mut self, validator: Arc<dyn MetadataValidator>) -> Self {
        self.validator = Some(validator);
        self.rebuild_preserver()
    }

    pub fn with_lock(mut self, locks: Arc<dyn NamedLock>) -> Self {
        self.locks = locks;
        self
    }

    pub fn config(&self) -> &BaggerConfig {
        &self.config
    }

    pub fn read_model(&self) -> Arc<ReadModel> {
        Arc::clone(&self.read_model)
    }

    /// The in-process lock shared by every live queue handle of `id`
    ///
    /// Entries no handle refers to any more are dropped on the way.
    fn local_lock(&self, id: &str) -> Arc<ReentrantMutex<()>> {
        let mut locks = self.local_locks.lock();
        locks.retain(|key, lock| key == id || Arc::strong_count(lock) > 1);
        Arc::clone(
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(ReentrantMutex::new(()))),
        )
    }

    /// A handle on the queue of `id`, sharing this service's locks
    pub fn queue(&self, id: &str) -> UpdateQueue {
        UpdateQueue::new(&self.config.queue_dir, id, Arc::clone(&self.locks))
            .with_local_lock(self.local_lock(id))
    }

    pub fn queue_update(&self, id: &str, update: Value) -> Result<()> {
        self.queue(id).queue_update(update)
    }

    pub fn mark_for_hand_off(&self, id: &str, as_update: bool) -> Result<()> {
        self.queue(id).mark_for_hand_off(as_update)
    }

    /// Start a worker for `id` if none is running; true if one was started
    pub fn launch(&self, id: &str) -> Result<bool> {
        let worker = BaggingWorker::new(
            self.queue(id),
            Arc::clone(&self.applier),
            Arc::clone(&self.hand_off),
        )
        .with_poll_interval(self.config.poll_interval())
        .with_status_dir(&self.config.status_dir);
        self.registry.launch(worker)
    }

    pub fn is_working(&self, id: &str) -> bool {
        self.registry.is_working(id)
    }

    pub fn wait_for_completion(&self, id: &str, timeout: Option<Duration>) -> Result<bool> {
        self.registry.wait_for_completion(id, timeout)
    }

    /// Queue an update and make sure a worker will apply it
    pub fn submit(&self, id: &str, update: Value) -> Result<()> {
        self.queue_update(id, update)?;
        self.launch(id)?;
        Ok(())
    }

    pub fn status(&self, id: &str) -> Result<StatusExport> {
        read_status(&self.config.status_dir, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bag::{PackageReader, TagFile};
    use crate::config::MinterSettings;
    use crate::error::BagError;
    use crate::status::JobState;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> BaggerConfig {
        let mut config = BaggerConfig::for_root(dir.path());
        config.poll_interval_ms = 5;
        config.lock_retry_ms = 5;
        config
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.merge_convention = "nope".into();
        assert!(matches!(
            BaggingService::new(config),
            Err(BagError::Configuration(_))
        ));
    }

    #[test]
    fn test_submit_updates_read_model() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let service = BaggingService::new(config(&dir))?;
        service.submit("job1", json!({"title": "First"}))?;
        assert!(service.wait_for_completion("job1", Some(Duration::from_secs(10)))?);

        let record = service.read_model().get("job1").unwrap();
        assert_eq!(record["title"], "First");
        assert!(!service.is_working("job1"));
        Ok(())
    }

    #[test]
    fn test_full_preservation_flow() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("upload.txt");
        std::fs::write(&source, b"measurements").unwrap();
        let service = BaggingService::new(config(&dir))?;
        std::fs::create_dir_all(&service.config().store_dir).unwrap();

        service.queue_update(
            "mds2-7",
            json!({"title": "T", "components": [{"filepath": "run/upload.txt", "source": source}]}),
        )?;
        service.mark_for_hand_off("mds2-7", true)?;
        service.launch("mds2-7")?;
        assert!(service.wait_for_completion("mds2-7", Some(Duration::from_secs(30)))?);

        let status = service.status("mds2-7")?;
        assert_eq!(status.current.state, JobState::Successful);
        assert!(status.published);
        let delivered = service.config().store_dir.join("mds2-7.1_0.mbag0_4-0");
        assert!(delivered.join("data/run/upload.txt").is_file());
        assert!(delivered.join("multibag/file-lookup.tsv").is_file());
        Ok(())
    }

    #[test]
    fn test_configured_minter_and_required_fields() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.minter = Some(MinterSettings {
            prefix: "ark:/88434/".into(),
            shoulder: "mds2".into(),
            state_file: Some(dir.path().join("minter.json")),
        });
        config.required_fields = vec!["title".into()];
        let service = BaggingService::new(config)?;
        std::fs::create_dir_all(&service.config().store_dir).unwrap();

        service.queue_update("mds2-8", json!({"description": "no title yet"}))?;
        service.mark_for_hand_off("mds2-8", true)?;
        service.launch("mds2-8")?;
        let err = service
            .wait_for_completion("mds2-8", Some(Duration::from_secs(30)))
            .unwrap_err();
        assert!(err.problems().iter().any(|p| p.contains("title")));
        assert_eq!(service.status("mds2-8")?.current.state, JobState::Failed);

        service.queue_update("mds2-8", json!({"title": "Named"}))?;
        service.mark_for_hand_off("mds2-8", true)?;
        service.launch("mds2-8")?;
        assert!(service.wait_for_completion("mds2-8", Some(Duration::from_secs(30)))?);

        let record = PackageReader::new(service.config().bag_dir("mds2-8")).resource()?;
        let ark = record["@id"].as_str().unwrap().to_string();
        assert!(ark.starts_with("ark:/88434/mds2"));
        let delivered = service.config().store_dir.join("mds2-8.1_0.mbag0_4-0");
        let info = TagFile::read(&delivered.join("bag-info.txt"))?;
        assert_eq!(info.first("External-Identifier"), Some(ark.as_str()));
        Ok(())
    }

    #[test]
    fn test_revision_gets_next_sequence_and_deprecates() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let service = BaggingService::new(config(&dir))?;
        std::fs::create_dir_all(&service.config().store_dir).unwrap();

        service.queue_update("mds2-9", json!({"title": "T1"}))?;
        service.mark_for_hand_off("mds2-9", true)?;
        service.launch("mds2-9")?;
        assert!(service.wait_for_completion("mds2-9", Some(Duration::from_secs(30)))?);

        service.queue_update("mds2-9", json!({"title": "T2", "version": "1.1"}))?;
        service.mark_for_hand_off("mds2-9", true)?;
        service.launch("mds2-9")?;
        assert!(service.wait_for_completion("mds2-9", Some(Duration::from_secs(30)))?);

        let status = service.status("mds2-9")?;
        assert_eq!(status.current.state, JobState::Successful);
        assert!(service.config().bag_dir("mds2-9").join("bagit.txt").is_file());
        assert!(!service.config().quarantine_dir.exists());

        let store = &service.config().store_dir;
        assert!(store.join("mds2-9.1_0.mbag0_4-0").is_dir());
        let revised = store.join("mds2-9.1_1.mbag0_4-1");
        let info = TagFile::read(&revised.join("bag-info.txt"))?;
        assert_eq!(info.first("Multibag-Head-Deprecates"), Some("mds2-9.1_0.mbag0_4-0"));
        assert!(revised.join("multibag/deprecated-info.txt").is_file());
        Ok(())
    }

    #[test]
    fn test_permanent_failure_keeps_working_bag() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let service = BaggingService::new(config(&dir))?;
        // no store directory: every delivery is rejected permanently
        service.queue_update("mds2-10", json!({"title": "T"}))?;
        service.mark_for_hand_off("mds2-10", true)?;
        service.launch("mds2-10")?;
        let err = service
            .wait_for_completion("mds2-10", Some(Duration::from_secs(30)))
            .unwrap_err();
        assert!(matches!(err, BagError::PermanentService(_)));

        let bag = service.config().bag_dir("mds2-10");
        assert!(bag.join("bagit.txt").is_file());
        let quarantined: Vec<_> = std::fs::read_dir(&service.config().quarantine_dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(quarantined.len(), 1);
        assert!(quarantined[0].join("bagit.txt").is_file());
        Ok(())
    }

    #[test]
    fn test_local_locks_are_evicted() {
        let dir = TempDir::new().unwrap();
        let service = BaggingService::new(config(&dir)).unwrap();
        for n in 0..10 {
            let _ = service.queue(&format!("job{}", n));
        }
        let held = service.queue("kept");
        let _ = service.queue("last");
        let locks = service.local_locks.lock();
        assert!(locks.len() <= 2);
        assert!(locks.contains_key("kept"));
        drop(held);
    }
}
