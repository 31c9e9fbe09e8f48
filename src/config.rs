//! Service and splitter configuration
//!
//! Settings are plain serde structs so they can come from a TOML or JSON
//! file, or be assembled in code. Every consumer calls [`BaggerConfig::validate`]
//! at construction; an invalid configuration is fatal.

use crate::error::{BagError, IoContext, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to do when a hard link cannot be created while placing a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkFallback {
    /// Fall back to a full copy
    #[default]
    Copy,
    /// Report the failure as a state error
    Fail,
}

/// Size bounds and naming profile used when partitioning a finished bag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitterConfig {
    /// Bags larger than this (in bytes) get split
    pub max_size: u64,

    /// Preferred content size of each member bag
    pub target_size: u64,

    /// Content allowance for the head bag on top of its metadata
    pub head_target_size: u64,

    /// Fractional tolerance applied when deciding to fold content into the head
    pub slop: f64,

    /// Multibag profile version stamped into names and bag-info
    pub profile_version: String,

    /// Hard-link member files from the source instead of copying
    pub prefer_links: bool,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        SplitterConfig {
            max_size: 1_000_000_000,
            target_size: 800_000_000,
            head_target_size: 50_000_000,
            slop: 0.05,
            profile_version: "0.4".to_string(),
            prefer_links: true,
        }
    }
}

impl SplitterConfig {
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.max_size == 0 || self.target_size == 0 {
            problems.push("max_size and target_size must be positive".to_string());
        }
        if self.target_size > self.max_size {
            problems.push(format!(
                "target_size ({}) exceeds max_size ({})",
                self.target_size, self.max_size
            ));
        }
        if self.head_target_size.saturating_add(self.target_size) > self.max_size {
            problems.push(format!(
                "head_target_size + target_size ({}) exceeds max_size ({})",
                self.head_target_size.saturating_add(self.target_size),
                self.max_size
            ));
        }
        if !self.slop.is_finite() || self.slop < 0.0 {
            problems.push(format!("slop must be a non-negative number, got {}", self.slop));
        }
        if !is_dotted_version(&self.profile_version) || self.profile_version.split('.').count() != 2 {
            problems.push(format!(
                "profile_version '{}' must look like MAJOR.MINOR",
                self.profile_version
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BagError::Configuration(problems.join("; ")))
        }
    }

    /// `bound * (1 + slop)`, rounded down to whole bytes
    pub fn with_slop(&self, bound: u64) -> u64 {
        (bound as f64 * (1.0 + self.slop)).floor() as u64
    }
}

/// Identifier minting for preserved bags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinterSettings {
    /// Prepended to every identifier, e.g. `ark:/88434/`
    #[serde(default)]
    pub prefix: String,
    pub shoulder: String,
    /// Counter and seed assignments survive restarts when set
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

/// Top-level settings for the bagging service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaggerConfig {
    /// Where bags under construction live (`<working_dir>/<id>`)
    pub working_dir: PathBuf,

    /// Per-job queue slots (`<queue_dir>/<id>/`)
    pub queue_dir: PathBuf,

    /// Job status records (`<status_dir>/<id>.json`)
    pub status_dir: PathBuf,

    /// Split output (member bags)
    pub output_dir: PathBuf,

    /// Destination of the default directory deliverer
    pub store_dir: PathBuf,

    /// Members that failed delivery permanently are moved here
    pub quarantine_dir: PathBuf,

    pub link_fallback: LinkFallback,

    /// Name of the merge convention for annotation overlays
    pub merge_convention: String,

    /// Release version given to new head bags
    pub release_version: String,

    pub lock_timeout_ms: u64,
    pub lock_retry_ms: u64,
    pub poll_interval_ms: u64,

    /// Attempts per member before a transient delivery failure is given up on
    pub delivery_attempts: u32,

    pub splitter: SplitterConfig,

    /// Assign minted identifiers when bags are preserved
    pub minter: Option<MinterSettings>,

    /// Resource fields every bag must carry before it is finalized
    pub required_fields: Vec<String>,
}

impl Default for BaggerConfig {
    fn default() -> Self {
        BaggerConfig::for_root("bagsmith")
    }
}

impl BaggerConfig {
    /// Lay out every working directory beneath one root
    pub fn for_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        BaggerConfig {
            working_dir: root.join("work"),
            queue_dir: root.join("queue"),
            status_dir: root.join("status"),
            output_dir: root.join("output"),
            store_dir: root.join("store"),
            quarantine_dir: root.join("quarantine"),
            link_fallback: LinkFallback::Copy,
            merge_convention: "dev".to_string(),
            release_version: "1.0".to_string(),
            lock_timeout_ms: 30_000,
            lock_retry_ms: 50,
            poll_interval_ms: 100,
            delivery_attempts: 3,
            splitter: SplitterConfig::default(),
            minter: None,
            required_fields: Vec::new(),
        }
    }

    /// Parse TOML configuration text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: BaggerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).ctx("read config", path)?;
        let config: BaggerConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            Some("toml") => toml::from_str(&text)?,
            other => {
                return Err(BagError::Configuration(format!(
                    "unsupported config format {:?} for {}",
                    other,
                    path.display()
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        for (name, dir) in [
            ("working_dir", &self.working_dir),
            ("queue_dir", &self.queue_dir),
            ("status_dir", &self.status_dir),
            ("output_dir", &self.output_dir),
            ("store_dir", &self.store_dir),
            ("quarantine_dir", &self.quarantine_dir),
        ] {
            if dir.as_os_str().is_empty() {
                problems.push(format!("{} must not be empty", name));
            }
        }

        if !crate::bag::merge::MergerRegistry::with_defaults().supports(&self.merge_convention) {
            problems.push(format!("unknown merge convention '{}'", self.merge_convention));
        }
        if !is_dotted_version(&self.release_version) {
            problems.push(format!(
                "release_version '{}' must be dot-separated digits",
                self.release_version
            ));
        }
        if self.lock_timeout_ms == 0 {
            problems.push("lock_timeout_ms must be positive".to_string());
        }
        if self.delivery_attempts == 0 {
            problems.push("delivery_attempts must be at least 1".to_string());
        }
        if let Err(BagError::Configuration(msg)) = self.splitter.validate() {
            problems.push(msg);
        }
        if let Some(minter) = &self.minter {
            if minter.shoulder.is_empty() {
                problems.push("minter shoulder must not be empty".to_string());
            }
        }
        if self.required_fields.iter().any(|f| f.trim().is_empty()) {
            problems.push("required_fields must not contain blank names".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BagError::Configuration(problems.join("; ")))
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Where named-lock files for job ids are kept
    pub fn lock_dir(&self) -> PathBuf {
        self.queue_dir.join("_locks")
    }

    pub fn bag_dir(&self, id: &str) -> PathBuf {
        self.working_dir.join(id)
    }
}

pub(crate) fn is_dotted_version(version: &str) -> bool {
    !version.is_empty()
        && version
            .split('.')
            .all(|seg| !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()))
}
