use super::UpdateApplier;
use crate::bag::merge::MergerRegistry;
use crate::bag::{PackageBuilder, PackageReader};
use crate::config::{BaggerConfig, LinkFallback};
use crate::error::{BagError, Result};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Assembled package records, refreshed after each applied update
pub struct ReadModel {
    working_dir: PathBuf,
    mergers: Arc<MergerRegistry>,
    convention: String,
    records: RwLock<HashMap<String, Value>>,
}

impl ReadModel {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        ReadModel {
            working_dir: working_dir.as_ref().to_path_buf(),
            mergers: Arc::new(MergerRegistry::with_defaults()),
            convention: "dev".to_string(),
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_merge_convention(
        mut self,
        mergers: Arc<MergerRegistry>,
        convention: impl Into<String>,
    ) -> Self {
        self.mergers = mergers;
        self.convention = convention.into();
        self
    }

    pub fn from_config(config: &BaggerConfig) -> Self {
        ReadModel::new(&config.working_dir).with_merge_convention(
            Arc::new(MergerRegistry::with_defaults()),
            config.merge_convention.clone(),
        )
    }

    /// Re-assemble the record for `id` from its bag
    pub fn refresh(&self, id: &str) -> Result<Value> {
        let record = PackageReader::new(self.working_dir.join(id))
            .with_merge_convention(Arc::clone(&self.mergers), self.convention.clone())
            .assemble()?;
        self.records.write().insert(id.to_string(), record.clone());
        debug!("Refreshed read model for {}", id);
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.records.read().get(id).cloned()
    }

    pub fn forget(&self, id: &str) {
        self.records.write().remove(id);
    }
}

/// Applies JSON updates to `<working_dir>/<id>`
///
/// Top-level fields merge into the resource record. Each entry of
/// `components` names a `filepath`; a `source` places that file as data,
/// `_remove: true` deletes the component (trimming emptied folders), and any
/// other fields merge into the component's record.
pub struct PackageUpdater {
    working_dir: PathBuf,
    link_fallback: LinkFallback,
    read_model: Option<Arc<ReadModel>>,
}

impl PackageUpdater {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        PackageUpdater {
            working_dir: working_dir.as_ref().to_path_buf(),
            link_fallback: LinkFallback::Copy,
            read_model: None,
        }
    }

    pub fn with_link_fallback(mut self, fallback: LinkFallback) -> Self {
        self.link_fallback = fallback;
        self
    }

    pub fn with_read_model(mut self, model: Arc<ReadModel>) -> Self {
        self.read_model = Some(model);
        self
    }

    fn apply_component(builder: &PackageBuilder, entry: &Value) -> Result<()> {
        let Value::Object(fields) = entry else {
            return Err(BagError::invalid("component update must be a JSON object"));
        };
        let filepath = fields
            .get("filepath")
            .and_then(Value::as_str)
            .ok_or_else(|| BagError::invalid("component update lacks a 'filepath'"))?;

        if fields.get("_remove").and_then(Value::as_bool) == Some(true) {
            builder.remove_component(filepath, true)?;
            return Ok(());
        }

        let source = fields.get("source").and_then(Value::as_str);
        if let Some(source) = source {
            builder.add_data_file(filepath, Path::new(source), true)?;
        }

        let metadata: Map<String, Value> = fields
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "filepath" | "source" | "_remove"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !metadata.is_empty() || source.is_none() {
            builder.update_component_metadata(filepath, Value::Object(metadata))?;
        }
        Ok(())
    }
}

impl UpdateApplier for PackageUpdater {
    fn apply(&self, id: &str, update: &Value) -> Result<()> {
        let Value::Object(fields) = update else {
            return Err(BagError::invalid(format!("update for {} must be a JSON object", id)));
        };
        let builder =
            PackageBuilder::new(self.working_dir.join(id)).with_link_fallback(self.link_fallback);
        builder.ensure_structure()?;

        let mut resource = fields.clone();
        let components = resource.remove("components");
        if !resource.is_empty() {
            builder.update_resource_metadata(Value::Object(resource))?;
        }

        match components {
            None | Some(Value::Null) => {}
            Some(Value::Array(entries)) => {
                for entry in &entries {
                    Self::apply_component(&builder, entry)?;
                }
            }
            Some(_) => return Err(BagError::invalid("'components' must be an array")),
        }
        Ok(())
    }

    fn refresh(&self, id: &str) -> Result<()> {
        if let Some(model) = &self.read_model {
            model.refresh(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_apply_resource_and_components() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("upload.csv");
        std::fs::write(&src, b"x,y\n").unwrap();
        let model = Arc::new(ReadModel::new(dir.path().join("work")));
        let updater = PackageUpdater::new(dir.path().join("work")).with_read_model(model.clone());

        updater.apply(
            "job1",
            &json!({
                "title": "Trial data",
                "components": [
                    {"filepath": "t/upload.csv", "source": src.to_str().unwrap(), "title": "Run"},
                    {"filepath": "docs"}
                ]
            }),
        )?;
        updater.refresh("job1")?;

        let record = model.get("job1").unwrap();
        assert_eq!(record["title"], "Trial data");
        let paths: Vec<_> = record["components"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["filepath"].as_str().unwrap())
            .collect();
        assert_eq!(paths, vec!["docs", "t", "t/upload.csv"]);
        Ok(())
    }

    #[test]
    fn test_remove_component_update() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let updater = PackageUpdater::new(dir.path());
        updater.apply("job1", &json!({"components": [{"filepath": "a/b.txt", "title": "t"}]}))?;
        updater.apply("job1", &json!({"components": [{"filepath": "a/b.txt", "_remove": true}]}))?;
        let reader = PackageReader::new(dir.path().join("job1"));
        assert!(reader.component_paths()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_malformed_updates_rejected() {
        let dir = TempDir::new().unwrap();
        let updater = PackageUpdater::new(dir.path());
        assert!(updater.apply("job1", &json!([1, 2])).is_err());
        assert!(updater.apply("job1", &json!({"components": {"filepath": "x"}})).is_err());
        assert!(updater.apply("job1", &json!({"components": [{"title": "no path"}]})).is_err());
    }
}
