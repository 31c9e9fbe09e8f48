//! Collaborator seams: metadata validation and delivery to preservation
//!
//! Real deployments plug in schema validators and repository clients; the
//! built-in implementations cover required-field checks and delivery into a
//! local store directory.

use crate::bag::manifest::relative_path;
use crate::bag::ComponentKind;
use crate::error::{BagError, Result};
use crate::multibag::BagName;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Checks an assembled package record
pub trait MetadataValidator: Send + Sync {
    /// `Ok` if the record passes, else every reason it does not
    fn validate(&self, record: &Value) -> std::result::Result<(), Vec<String>>;
}

/// Requires non-empty fields on the resource and on every file component
#[derive(Debug, Clone, Default)]
pub struct RequiredFields {
    resource: Vec<String>,
    component: Vec<String>,
}

impl RequiredFields {
    pub fn new<I, S>(resource_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RequiredFields {
            resource: resource_fields.into_iter().map(Into::into).collect(),
            component: Vec::new(),
        }
    }

    pub fn with_component_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.component = fields.into_iter().map(Into::into).collect();
        self
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        Some(_) => false,
    }
}

impl MetadataValidator for RequiredFields {
    fn validate(&self, record: &Value) -> std::result::Result<(), Vec<String>> {
        let mut reasons: Vec<String> = self
            .resource
            .iter()
            .filter(|f| is_blank(record.get(f.as_str())))
            .map(|f| format!("resource is missing '{}'", f))
            .collect();

        if !self.component.is_empty() {
            let components = record
                .get("components")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for comp in components {
                if !ComponentKind::from_record(comp).map_or(false, |k| k.is_file()) {
                    continue;
                }
                let fp = comp.get("filepath").and_then(Value::as_str).unwrap_or("?");
                for field in &self.component {
                    if is_blank(comp.get(field.as_str())) {
                        reasons.push(format!("{} is missing '{}'", fp, field));
                    }
                }
            }
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(reasons)
        }
    }
}

/// A member bag ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedPackage {
    pub name: String,
    pub path: PathBuf,
    pub head: bool,
}

/// Hands a finished package to long-term storage
///
/// Failures must be [`BagError::TransientService`] (worth retrying) or
/// [`BagError::PermanentService`] (quarantine the job).
pub trait Deliverer: Send + Sync {
    fn deliver(&self, package: &FinishedPackage) -> Result<()>;

    /// Names of the members already stored for `aipid`
    fn delivered(&self, _aipid: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Copy every file below `source` into `dest`, returning the file count
pub(crate) fn copy_tree(source: &Path, dest: &Path) -> std::io::Result<u64> {
    let mut copied = 0;
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry?;
        let Some(rel) = relative_path(source, entry.path()) else {
            fs::create_dir_all(dest)?;
            continue;
        };
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Copies members into `<store>/<name>`
#[derive(Debug, Clone)]
pub struct DirectoryDeliverer {
    store: PathBuf,
}

impl DirectoryDeliverer {
    pub fn new(store: impl AsRef<Path>) -> Self {
        DirectoryDeliverer {
            store: store.as_ref().to_path_buf(),
        }
    }

    pub fn store(&self) -> &Path {
        &self.store
    }
}

impl Deliverer for DirectoryDeliverer {
    fn delivered(&self, aipid: &str) -> Result<Vec<String>> {
        if !self.store.is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.store).map_err(|e| {
            BagError::TransientService(format!("listing {}: {}", self.store.display(), e))
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                BagError::TransientService(format!("listing {}: {}", self.store.display(), e))
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if BagName::parse(&name).map_or(false, |parsed| parsed.aipid == aipid) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn deliver(&self, package: &FinishedPackage) -> Result<()> {
        if !self.store.is_dir() {
            return Err(BagError::PermanentService(format!(
                "store directory {} does not exist",
                self.store.display()
            )));
        }
        if !package.path.is_dir() {
            return Err(BagError::PermanentService(format!(
                "package {} is not a directory",
                package.path.display()
            )));
        }
        let dest = self.store.join(&package.name);
        if dest.exists() {
            return Err(BagError::PermanentService(format!(
                "{} is already in the store",
                package.name
            )));
        }

        let partial = self.store.join(format!(".{}.partial", package.name));
        if partial.exists() {
            debug!("Clearing stale partial delivery {:?}", partial);
            fs::remove_dir_all(&partial).map_err(|e| {
                BagError::TransientService(format!("clearing {}: {}", partial.display(), e))
            })?;
        }

        let copied = copy_tree(&package.path, &partial)
            .and_then(|n| fs::rename(&partial, &dest).map(|_| n));
        match copied {
            Ok(files) => {
                info!("Delivered {} ({} file(s)) to {:?}", package.name, files, self.store);
                Ok(())
            }
            Err(e) => {
                if partial.exists() {
                    if let Err(cleanup) = fs::remove_dir_all(&partial) {
                        warn!("Could not remove {:?}: {}", partial, cleanup);
                    }
                }
                Err(BagError::TransientService(format!(
                    "delivering {}: {}",
                    package.name, e
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_required_fields_collects_every_reason() {
        let validator = RequiredFields::new(["title", "contactPoint"])
            .with_component_fields(["description"]);
        let record = json!({
            "title": "  ",
            "components": [
                {"filepath": "a.csv", "@type": ["nrdp:DataFile"], "description": ""},
                {"filepath": "b.csv", "@type": ["nrdp:DataFile"], "description": "ok"},
                {"filepath": "dir", "@type": ["nrdp:Subcollection"]}
            ]
        });
        let reasons = validator.validate(&record).unwrap_err();
        assert_eq!(
            reasons,
            vec![
                "resource is missing 'title'".to_string(),
                "resource is missing 'contactPoint'".to_string(),
                "a.csv is missing 'description'".to_string(),
            ]
        );
    }

    #[test]
    fn test_directory_deliverer() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("store");
        fs::create_dir_all(&store).unwrap();
        let bag = dir.path().join("bag");
        fs::create_dir_all(bag.join("data/sub")).unwrap();
        fs::write(bag.join("data/sub/x.txt"), b"x").unwrap();

        let deliverer = DirectoryDeliverer::new(&store);
        let package = FinishedPackage {
            name: "bag.1_0.mbag0_4-0".into(),
            path: bag,
            head: true,
        };
        deliverer.deliver(&package).unwrap();
        assert!(store.join("bag.1_0.mbag0_4-0/data/sub/x.txt").is_file());

        let again = deliverer.deliver(&package).unwrap_err();
        assert!(matches!(again, BagError::PermanentService(_)));
        assert!(!again.is_transient());

        fs::create_dir_all(store.join("other.1_0.mbag0_4-0")).unwrap();
        fs::create_dir_all(store.join(".bag.1_0.mbag0_4-1.partial")).unwrap();
        assert_eq!(deliverer.delivered("bag").unwrap(), vec!["bag.1_0.mbag0_4-0"]);
    }

    #[test]
    fn test_missing_store_is_permanent() {
        let dir = TempDir::new().unwrap();
        let deliverer = DirectoryDeliverer::new(dir.path().join("nowhere"));
        let package = FinishedPackage {
            name: "x".into(),
            path: dir.path().to_path_buf(),
            head: true,
        };
        assert!(matches!(
            deliverer.deliver(&package),
            Err(BagError::PermanentService(_))
        ));
    }
}
