//! Read-only queries over a bag
//!
//! Records are merged with their annotation overlays on every read, and the
//! whole-package record (inventory and hierarchy included) is rebuilt from the
//! current descriptive tree each time [`PackageReader::assemble`] is called.

use super::builder::read_record;
use super::manifest::{read_manifest, relative_path, ManifestEntry};
use super::merge::{MergerRegistry, RecordType};
use super::tagfile::TagFile;
use super::{
    normalize_filepath, parent_of, ComponentKind, ANNOT_FILE, BAG_INFO_FILE, DATA_DIR,
    MANIFEST_FILE, METADATA_DIR, RECORD_FILE,
};
use crate::error::{BagError, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

pub struct PackageReader {
    root: PathBuf,
    mergers: Arc<MergerRegistry>,
    convention: String,
}

impl PackageReader {
    /// Reader using the built-in `dev` merge convention
    pub fn new(root: impl AsRef<Path>) -> Self {
        PackageReader {
            root: root.as_ref().to_path_buf(),
            mergers: Arc::new(MergerRegistry::with_defaults()),
            convention: "dev".to_string(),
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

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn metadata_dir(&self) -> PathBuf {
        self.root.join(METADATA_DIR)
    }

    fn data_path(&self, fp: &str) -> PathBuf {
        self.root.join(DATA_DIR).join(fp)
    }

    /// A component's record without any annotation applied
    pub fn base_component(&self, filepath: &str) -> Result<Option<Value>> {
        let fp = normalize_filepath(filepath)?;
        read_record(&self.metadata_dir().join(&fp).join(RECORD_FILE))
    }

    /// A component's record merged with its annotations
    pub fn component(&self, filepath: &str) -> Result<Value> {
        let fp = normalize_filepath(filepath)?;
        let dir = self.metadata_dir().join(&fp);
        let base = read_record(&dir.join(RECORD_FILE))?
            .ok_or_else(|| BagError::NotFound(format!("component {}", fp)))?;
        self.merged(RecordType::Component, base, &dir.join(ANNOT_FILE))
    }

    /// The resource-level record merged with its annotations
    pub fn resource(&self) -> Result<Value> {
        let dir = self.metadata_dir();
        let base = read_record(&dir.join(RECORD_FILE))?.ok_or_else(|| {
            BagError::NotFound(format!("resource record in {}", self.root.display()))
        })?;
        self.merged(RecordType::Resource, base, &dir.join(ANNOT_FILE))
    }

    fn merged(&self, rtype: RecordType, base: Value, annot: &Path) -> Result<Value> {
        match read_record(annot)? {
            Some(overlay) => self.mergers.merge(&self.convention, rtype, &base, &overlay),
            None => Ok(base),
        }
    }

    /// Every described component, sorted by filepath
    pub fn component_paths(&self) -> Result<Vec<String>> {
        component_filepaths(&self.root)
    }

    /// The whole-package record
    ///
    /// Components are listed in filepath order with `inventory` and
    /// `dataHierarchy` derived from them.
    pub fn assemble(&self) -> Result<Value> {
        let mut record = self.resource()?;
        let components = self
            .component_paths()?
            .iter()
            .map(|fp| self.component(fp))
            .collect::<Result<Vec<_>>>()?;

        if let Value::Object(map) = &mut record {
            map.insert("inventory".into(), inventory(&components));
            map.insert("dataHierarchy".into(), hierarchy(&components));
            map.insert("components".into(), Value::Array(components));
        }
        Ok(record)
    }

    /// True if the component is present as data or has a record
    pub fn exists(&self, filepath: &str) -> Result<bool> {
        let fp = normalize_filepath(filepath)?;
        Ok(self.data_path(&fp).exists()
            || self.metadata_dir().join(&fp).join(RECORD_FILE).exists())
    }

    pub fn is_data_file(&self, filepath: &str) -> Result<bool> {
        Ok(self.kind_of(filepath)?.map_or(false, |k| k.is_file()))
    }

    pub fn is_subcollection(&self, filepath: &str) -> Result<bool> {
        Ok(self.kind_of(filepath)? == Some(ComponentKind::Subcollection))
    }

    /// On-disk presence under `data/` decides first, then the record's type tags
    fn kind_of(&self, filepath: &str) -> Result<Option<ComponentKind>> {
        let fp = normalize_filepath(filepath)?;
        let data = self.data_path(&fp);
        if data.is_file() {
            return Ok(Some(ComponentKind::for_file(&fp)));
        }
        if data.is_dir() {
            return Ok(Some(ComponentKind::Subcollection));
        }
        Ok(self
            .base_component(&fp)?
            .and_then(|r| ComponentKind::from_record(&r)))
    }

    pub fn bag_info(&self) -> Result<TagFile> {
        let path = self.root.join(BAG_INFO_FILE);
        if !path.exists() {
            return Err(BagError::NotFound(format!("{}", path.display())));
        }
        TagFile::read(&path)
    }

    pub fn manifest(&self) -> Result<Vec<ManifestEntry>> {
        let path = self.root.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(BagError::NotFound(format!("{}", path.display())));
        }
        read_manifest(&path)
    }
}

/// Filepaths of every component record under `metadata/`, sorted
pub(crate) fn component_filepaths(root: &Path) -> Result<Vec<String>> {
    let meta = root.join(METADATA_DIR);
    let mut paths = Vec::new();
    if !meta.is_dir() {
        return Ok(paths);
    }

    for entry in WalkDir::new(&meta).min_depth(2) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| meta.clone());
            BagError::io("walk metadata", path, e.into())
        })?;
        if !entry.file_type().is_file() || entry.file_name() != RECORD_FILE {
            continue;
        }
        if let Some(fp) = entry.path().parent().and_then(|p| relative_path(&meta, p)) {
            paths.push(fp);
        }
    }
    paths.sort();
    Ok(paths)
}

fn record_filepath(record: &Value) -> Option<&str> {
    record.get("filepath").and_then(Value::as_str)
}

fn record_types(record: &Value) -> Vec<String> {
    record
        .get("@type")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Default)]
struct Tally {
    children: u64,
    descendants: u64,
    by_type: BTreeMap<String, (u64, u64)>,
}

/// Per-folder counts of components, overall and per type tag
///
/// One entry per folder (`""` for the top level) with `childCount`
/// (direct members) and `descCount` (all members below it).
pub fn inventory(components: &[Value]) -> Value {
    let mut tallies: BTreeMap<String, Tally> = BTreeMap::new();
    tallies.entry(String::new()).or_default();

    for comp in components {
        let Some(fp) = record_filepath(comp) else {
            continue;
        };
        if ComponentKind::from_record(comp) == Some(ComponentKind::Subcollection) {
            tallies.entry(fp.to_string()).or_default();
        }
        let types = record_types(comp);
        let parent = parent_of(fp);

        let mut folder = parent.to_string();
        loop {
            let tally = tallies.entry(folder.clone()).or_default();
            let direct = folder == parent;
            tally.descendants += 1;
            if direct {
                tally.children += 1;
            }
            for t in &types {
                let counts = tally.by_type.entry(t.clone()).or_default();
                counts.1 += 1;
                if direct {
                    counts.0 += 1;
                }
            }
            if folder.is_empty() {
                break;
            }
            folder = parent_of(&folder).to_string();
        }
    }

    Value::Array(
        tallies
            .into_iter()
            .map(|(folder, tally)| {
                let by_type: Vec<Value> = tally
                    .by_type
                    .into_iter()
                    .map(|(t, (child, desc))| {
                        json!({"forType": t, "childCount": child, "descCount": desc})
                    })
                    .collect();
                json!({
                    "forCollection": folder,
                    "childCount": tally.children,
                    "descCount": tally.descendants,
                    "byType": by_type,
                })
            })
            .collect(),
    )
}

/// Nested folder tree of component filepaths
pub fn hierarchy(components: &[Value]) -> Value {
    let mut by_parent: BTreeMap<&str, Vec<(&str, bool)>> = BTreeMap::new();
    for comp in components {
        if let Some(fp) = record_filepath(comp) {
            let folder = ComponentKind::from_record(comp) == Some(ComponentKind::Subcollection);
            by_parent.entry(parent_of(fp)).or_default().push((fp, folder));
        }
    }
    Value::Array(subtree("", &by_parent))
}

fn subtree(parent: &str, by_parent: &BTreeMap<&str, Vec<(&str, bool)>>) -> Vec<Value> {
    let Some(children) = by_parent.get(parent) else {
        return Vec::new();
    };
    let mut children = children.clone();
    children.sort();
    children
        .into_iter()
        .map(|(fp, folder)| {
            let mut node = Map::new();
            node.insert("filepath".into(), json!(fp));
            if folder {
                node.insert("children".into(), Value::Array(subtree(fp, by_parent)));
            }
            Value::Object(node)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bag::PackageBuilder;
    use tempfile::TempDir;

    fn sample_bag(dir: &TempDir) -> PackageBuilder {
        let src = dir.path().join("src.txt");
        std::fs::write(&src, b"hello").unwrap();
        let builder = PackageBuilder::new(dir.path().join("bag"));
        builder.add_data_file("a/b/one.txt", &src, false).unwrap();
        builder.add_data_file("a/two.csv", &src, false).unwrap();
        builder.add_data_file("top.txt.sha256", &src, false).unwrap();
        builder
            .update_resource_metadata(json!({"title": "Sample"}))
            .unwrap();
        builder
    }

    #[test]
    fn test_component_applies_annotation() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let builder = sample_bag(&dir);
        builder.set_annotation(Some("a/two.csv"), json!({"title": "Annotated", "topic": ["t"]}))?;

        let reader = PackageReader::new(builder.root());
        let merged = reader.component("a/two.csv")?;
        assert_eq!(merged["title"], "Annotated");
        assert!(reader.base_component("a/two.csv")?.unwrap().get("title").is_none());

        let initdef = PackageReader::new(builder.root())
            .with_merge_convention(Arc::new(MergerRegistry::with_defaults()), "initdef");
        builder.update_component_metadata("a/two.csv", json!({"title": "Base"}))?;
        assert_eq!(initdef.component("a/two.csv")?["title"], "Base");
        Ok(())
    }

    #[test]
    fn test_unknown_convention_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let builder = sample_bag(&dir);
        builder.set_annotation(None, json!({"x": 1})).unwrap();
        let reader = PackageReader::new(builder.root())
            .with_merge_convention(Arc::new(MergerRegistry::new()), "dev");
        assert!(matches!(reader.resource(), Err(BagError::Configuration(_))));
    }

    #[test]
    fn test_assemble_is_deterministic() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let builder = sample_bag(&dir);
        let reader = PackageReader::new(builder.root());

        let first = reader.assemble()?;
        let second = reader.assemble()?;
        assert_eq!(first, second);

        let paths: Vec<_> = first["components"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["filepath"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(paths, vec!["a", "a/b", "a/b/one.txt", "a/two.csv", "top.txt.sha256"]);
        assert_eq!(first["title"], "Sample");
        Ok(())
    }

    #[test]
    fn test_inventory_counts() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let builder = sample_bag(&dir);
        let record = PackageReader::new(builder.root()).assemble()?;

        let inv = record["inventory"].as_array().unwrap();
        let top = inv.iter().find(|e| e["forCollection"] == "").unwrap();
        assert_eq!(top["childCount"], 2);
        assert_eq!(top["descCount"], 5);
        let a = inv.iter().find(|e| e["forCollection"] == "a").unwrap();
        assert_eq!(a["childCount"], 2);
        assert_eq!(a["descCount"], 3);
        let files = a["byType"]
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["forType"] == "nrdp:DataFile")
            .unwrap();
        assert_eq!(files["childCount"], 1);
        assert_eq!(files["descCount"], 2);
        Ok(())
    }

    #[test]
    fn test_inventory_recomputed_after_removal() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let builder = sample_bag(&dir);
        let reader = PackageReader::new(builder.root());
        builder.remove_component("a/b/one.txt", true)?;

        let record = reader.assemble()?;
        let inv = record["inventory"].as_array().unwrap();
        assert!(inv.iter().all(|e| e["forCollection"] != "a/b"));
        let top = inv.iter().find(|e| e["forCollection"] == "").unwrap();
        assert_eq!(top["descCount"], 3);
        Ok(())
    }

    #[test]
    fn test_hierarchy_nests_folders() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let builder = sample_bag(&dir);
        let record = PackageReader::new(builder.root()).assemble()?;
        assert_eq!(
            record["dataHierarchy"],
            json!([
                {"filepath": "a", "children": [
                    {"filepath": "a/b", "children": [{"filepath": "a/b/one.txt"}]},
                    {"filepath": "a/two.csv"}
                ]},
                {"filepath": "top.txt.sha256"}
            ])
        );
        Ok(())
    }

    #[test]
    fn test_predicates_prefer_disk_then_tags() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let builder = sample_bag(&dir);
        builder.update_component_metadata("described/only.dat", json!({"title": "t"}))?;
        let reader = PackageReader::new(builder.root());

        assert!(reader.is_data_file("a/two.csv")?);
        assert!(reader.is_subcollection("a/b")?);
        assert!(!reader.is_data_file("a")?);
        // no data yet, so the record's tags decide
        std::fs::remove_dir_all(builder.data_dir().join("described")).unwrap();
        assert!(reader.is_data_file("described/only.dat")?);
        assert!(reader.exists("described/only.dat")?);
        assert!(!reader.exists("missing.txt")?);
        assert!(matches!(reader.component("missing.txt"), Err(BagError::NotFound(_))));
        Ok(())
    }
}
