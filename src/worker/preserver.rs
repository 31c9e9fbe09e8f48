use super::HandOff;
use crate::bag::{PackageBuilder, PackageReader};
use crate::config::{is_dotted_version, BaggerConfig};
use crate::error::{BagError, IoContext, Result};
use crate::external::{copy_tree, Deliverer, FinishedPackage, MetadataValidator};
use crate::ident::IdMinter;
use crate::multibag::{latest, next_sequence, BagName, SplitOutcome, Splitter};
use crate::status::{JobState, JobStatus};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

/// Finalizes, splits and delivers a job's bag
///
/// `enhance` assigns the identifier (when a minter is configured) and
/// finalizes the bag. `hand_off` splits it into `<output_dir>/<id>/` and
/// delivers every member, head last. Members already in the store push the
/// new ones to later sequence numbers, and the new head records the latest
/// stored head as deprecated. Transient delivery failures are retried; a
/// permanent failure quarantines the split output, or a copy of the working
/// bag when it was indexed in place. The job's status record follows each step.
pub struct Preserver {
    config: BaggerConfig,
    deliverer: Arc<dyn Deliverer>,
    minter: Option<Arc<dyn IdMinter>>,
    validator: Option<Arc<dyn MetadataValidator>>,
}

impl Preserver {
    pub fn new(config: BaggerConfig, deliverer: Arc<dyn Deliverer>) -> Self {
        Preserver {
            config,
            deliverer,
            minter: None,
            validator: None,
        }
    }

    pub fn with_minter(mut self, minter: Arc<dyn IdMinter>) -> Self {
        self.minter = Some(minter);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn MetadataValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    fn status(&self, id: &str) -> Result<JobStatus> {
        JobStatus::open(&self.config.status_dir, id)
    }

    fn builder(&self, id: &str) -> PackageBuilder {
        let mut builder = PackageBuilder::new(self.config.bag_dir(id))
            .with_link_fallback(self.config.link_fallback);
        if let Some(minter) = &self.minter {
            builder = builder.with_minter(Arc::clone(minter));
        }
        if let Some(validator) = &self.validator {
            builder = builder.with_validator(Arc::clone(validator));
        }
        builder
    }

    fn deliver_with_retries(&self, package: &FinishedPackage) -> Result<()> {
        let attempts = self.config.delivery_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.deliverer.deliver(package) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        "Delivery of {} failed (attempt {}/{}): {}",
                        package.name, attempt, attempts, e
                    );
                    attempt += 1;
                    thread::sleep(self.config.poll_interval());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn quarantine(&self, id: &str, outcome: &SplitOutcome, out_dir: &Path) -> Option<PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let dest = self.config.quarantine_dir.join(format!("{}.{}", id, stamp));
        let moved = fs::create_dir_all(&self.config.quarantine_dir)
            .ctx("create quarantine", &self.config.quarantine_dir)
            .and_then(|_| {
                if outcome.split {
                    fs::rename(out_dir, &dest).ctx("quarantine split output", &dest)
                } else {
                    copy_tree(&outcome.head, &dest)
                        .map(|_| ())
                        .ctx("quarantine copy of bag", &dest)
                }
            });
        match moved {
            Ok(()) => {
                warn!("Quarantined output of {} as {:?}", id, dest);
                Some(dest)
            }
            Err(e) => {
                error!("Could not quarantine output of {}: {}", id, e);
                None
            }
        }
    }

    /// First member name for this preservation of `id`
    ///
    /// Returns the name and the latest head already stored, if any.
    fn base_name(&self, id: &str) -> Result<(BagName, Option<String>)> {
        let stored = self.deliverer.delivered(id)?;
        let names = stored.iter().map(String::as_str);
        let sequence = next_sequence(names.clone(), id);
        let previous = latest(names).map(str::to_string);

        let version = PackageReader::new(self.config.bag_dir(id))
            .resource()
            .ok()
            .and_then(|record| record.get("version").and_then(|v| v.as_str()).map(str::to_string))
            .filter(|v| is_dotted_version(v))
            .unwrap_or_else(|| self.config.release_version.clone());

        let candidate = BagName::new(id, version, self.config.splitter.profile_version.clone(), sequence);
        match BagName::parse(&candidate.to_string()) {
            Ok(parsed) if parsed.aipid == id => Ok((parsed, previous)),
            _ => Err(BagError::InvalidName(format!(
                "job id '{}' cannot name a bag",
                id
            ))),
        }
    }

    fn members(outcome: &SplitOutcome) -> Vec<FinishedPackage> {
        outcome
            .members
            .iter()
            .map(|path| {
                let head = path == &outcome.head;
                let name = if head {
                    outcome.head_name.clone()
                } else {
                    path.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default()
                };
                FinishedPackage {
                    name,
                    path: path.clone(),
                    head,
                }
            })
            .collect()
    }
}

impl HandOff for Preserver {
    fn enhance(&self, id: &str) -> Result<()> {
        let mut status = self.status(id)?;
        status.reset("preservation requested")?;
        status.start("finalizing bag")?;

        let builder = self.builder(id);
        let finalized = match &self.minter {
            Some(_) => builder.assign_identifier(id).and_then(|_| builder.finalize()),
            None => builder.finalize(),
        };
        match finalized {
            Ok(report) => {
                status.record_progress(format!("bag finalized ({} payload)", report.payload))?;
                Ok(())
            }
            Err(e) => {
                status.update(JobState::Failed, format!("finalization failed: {}", e))?;
                Err(e)
            }
        }
    }

    fn hand_off(&self, id: &str) -> Result<()> {
        let mut status = self.status(id)?;
        let out_dir = self.config.output_dir.join(id);

        let split = self.base_name(id).and_then(|(base, previous)| {
            let mut splitter = Splitter::new(self.config.splitter.clone())?
                .with_link_fallback(self.config.link_fallback)
                .with_base_name(base);
            if let Some(previous) = previous {
                info!("{} supersedes stored head {}", id, previous);
                splitter = splitter.with_deprecated_head(previous);
            }
            if out_dir.exists() {
                fs::remove_dir_all(&out_dir).ctx("clear previous split output", &out_dir)?;
            }
            splitter.split(&self.config.bag_dir(id), &out_dir)
        });
        let outcome = match split {
            Ok(outcome) => outcome,
            Err(e) => {
                status.update(JobState::Failed, format!("split failed: {}", e))?;
                return Err(e);
            }
        };
        status.record_progress(format!(
            "prepared {} member bag(s); head {}",
            outcome.members.len(),
            outcome.head_name
        ))?;

        for package in Self::members(&outcome) {
            if let Err(e) = self.deliver_with_retries(&package) {
                let mut message = format!("delivery of {} failed: {}", package.name, e);
                if matches!(e, BagError::PermanentService(_)) {
                    if let Some(dest) = self.quarantine(id, &outcome, &out_dir) {
                        message.push_str(&format!("; quarantined at {}", dest.display()));
                    }
                }
                status.update(JobState::Failed, message)?;
                return Err(e);
            }
        }

        status.set_sys("head_bag", serde_json::Value::String(outcome.head_name.clone()))?;
        status.update(
            JobState::Successful,
            format!("preserved as {}", outcome.head_name),
        )?;
        info!("Preserved {} as {}", id, outcome.head_name);
        Ok(())
    }
}
