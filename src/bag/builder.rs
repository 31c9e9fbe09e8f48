//! Constructing and mutating a bag on disk

use super::checksum::{sha256_file, Checksum};
use super::manifest::{
    format_bag_size, list_files, write_bagit_declaration, write_manifest, write_tag_manifest,
    ManifestEntry, PayloadOxum,
};
use super::merge::overlay_into;
use super::reader::{component_filepaths, PackageReader};
use super::tagfile::TagFile;
use super::{
    ancestors, checksum_value, component_id, media_type_for, normalize_filepath, place_file,
    ComponentKind, ANNOT_FILE, BAGIT_FILE, BAG_INFO_FILE, DATA_DIR, MANIFEST_FILE, METADATA_DIR,
    RECORD_FILE, RESOURCE_TYPE,
};
use crate::config::LinkFallback;
use crate::error::{BagError, IoContext, Result};
use crate::external::MetadataValidator;
use crate::ident::IdMinter;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Summary of a successful [`PackageBuilder::finalize`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeReport {
    pub payload: PayloadOxum,
    pub manifest_entries: usize,
    pub tag_entries: usize,
}

/// Creates and updates a bag's directory tree and descriptive records
///
/// # Examples
///
/// ```rust,no_run
/// use bagsmith::bag::PackageBuilder;
/// use serde_json::json;
///
/// # fn main() -> bagsmith::Result<()> {
/// let builder = PackageBuilder::new("/work/mds2-2106");
/// builder.ensure_structure()?;
/// builder.add_data_file("trial1/results.csv", "/upload/results.csv".as_ref(), true)?;
/// builder.update_component_metadata("trial1/results.csv", json!({"title": "Run 1"}))?;
/// let report = builder.finalize()?;
/// println!("payload {}", report.payload);
/// # Ok(())
/// # }
/// ```
pub struct PackageBuilder {
    root: PathBuf,
    link_fallback: LinkFallback,
    minter: Option<Arc<dyn IdMinter>>,
    validator: Option<Arc<dyn MetadataValidator>>,
}

impl PackageBuilder {
    pub fn new(root: impl AsRef<Path>) -> Self {
        PackageBuilder {
            root: root.as_ref().to_path_buf(),
            link_fallback: LinkFallback::Copy,
            minter: None,
            validator: None,
        }
    }

    pub fn with_link_fallback(mut self, fallback: LinkFallback) -> Self {
        self.link_fallback = fallback;
        self
    }

    pub fn with_minter(mut self, minter: Arc<dyn IdMinter>) -> Self {
        self.minter = Some(minter);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn MetadataValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join(METADATA_DIR)
    }

    fn record_path(&self, filepath: Option<&str>) -> PathBuf {
        match filepath {
            Some(fp) => self.metadata_dir().join(fp).join(RECORD_FILE),
            None => self.metadata_dir().join(RECORD_FILE),
        }
    }

    fn annotation_path(&self, filepath: Option<&str>) -> PathBuf {
        match filepath {
            Some(fp) => self.metadata_dir().join(fp).join(ANNOT_FILE),
            None => self.metadata_dir().join(ANNOT_FILE),
        }
    }

    /// Create `data/`, `metadata/`, the resource record and `bagit.txt`
    ///
    /// Calling it again on a complete tree changes nothing.
    pub fn ensure_structure(&self) -> Result<()> {
        if self.root.exists() && !self.root.is_dir() {
            return Err(BagError::State(format!(
                "bag root {} exists but is not a directory",
                self.root.display()
            )));
        }

        for dir in [self.root.clone(), self.data_dir(), self.metadata_dir()] {
            if !dir.is_dir() {
                fs::create_dir_all(&dir).ctx("create bag directory", &dir)?;
                debug!("Created {:?}", dir);
            }
        }

        let resource = self.record_path(None);
        if !resource.exists() {
            write_record(&resource, &json!({ "@type": [RESOURCE_TYPE] }))?;
        }
        if !self.root.join(BAGIT_FILE).exists() {
            write_bagit_declaration(&self.root)?;
        }
        Ok(())
    }

    /// Place a content file at `data/<filepath>` and describe it
    ///
    /// The file is hard-linked when `prefer_link` is set and linking works,
    /// otherwise copied (or rejected under [`LinkFallback::Fail`]). Its checksum,
    /// size and media type are recorded, and every ancestor folder gets a
    /// subcollection record.
    pub fn add_data_file(&self, filepath: &str, source: &Path, prefer_link: bool) -> Result<Value> {
        let fp = normalize_filepath(filepath)?;
        self.ensure_structure()?;

        if !source.is_file() {
            return Err(BagError::NotFound(format!(
                "source file {} for {}",
                source.display(),
                fp
            )));
        }
        if self.data_dir().join(&fp).is_dir() {
            return Err(BagError::invalid(format!("{} is already a subcollection", fp)));
        }
        self.ensure_ancestors(&fp)?;

        let dest = self.data_dir().join(&fp);
        place_file(source, &dest, prefer_link, self.link_fallback)?;

        let (hash, size) = sha256_file(&dest)?;
        let kind = ComponentKind::for_file(&fp);
        let mut record = self
            .read_component(&fp)?
            .unwrap_or_else(|| skeleton(&fp, kind));
        stamp_identity(&mut record, &fp, kind);
        if let Value::Object(map) = &mut record {
            map.insert("checksum".into(), checksum_value(&Checksum::sha256(hash)));
            map.insert("size".into(), json!(size));
            map.entry("mediaType")
                .or_insert_with(|| json!(media_type_for(&fp)));
        }
        write_record(&self.record_path(Some(&fp)), &record)?;

        debug!("Added data file {} ({} bytes)", fp, size);
        Ok(record)
    }

    /// Declare a (possibly empty) folder
    pub fn add_subcollection(&self, filepath: &str) -> Result<Value> {
        let fp = normalize_filepath(filepath)?;
        self.ensure_structure()?;
        self.ensure_ancestors(&fp)?;
        self.ensure_subcollection(&fp)?;
        self.read_component(&fp)?
            .ok_or_else(|| BagError::State(format!("subcollection record for {} vanished", fp)))
    }

    fn ensure_ancestors(&self, filepath: &str) -> Result<()> {
        for ancestor in ancestors(filepath) {
            self.ensure_subcollection(&ancestor)?;
        }
        Ok(())
    }

    fn ensure_subcollection(&self, fp: &str) -> Result<()> {
        let data = self.data_dir().join(fp);
        if data.is_file() {
            return Err(BagError::invalid(format!(
                "{} is a data file and cannot hold other components",
                fp
            )));
        }
        if !data.is_dir() {
            fs::create_dir_all(&data).ctx("create subcollection", &data)?;
        }

        let record_path = self.record_path(Some(fp));
        match read_record(&record_path)? {
            Some(record) => {
                if let Some(kind) = ComponentKind::from_record(&record) {
                    if kind.is_file() {
                        return Err(BagError::invalid(format!(
                            "{} is described as a file, not a subcollection",
                            fp
                        )));
                    }
                }
            }
            None => {
                write_record(&record_path, &skeleton(fp, ComponentKind::Subcollection))?;
                debug!("Created subcollection record for {}", fp);
            }
        }
        Ok(())
    }

    /// Replace a component's descriptive record with `fields`
    pub fn set_component_metadata(&self, filepath: &str, fields: Value) -> Result<Value> {
        let fp = normalize_filepath(filepath)?;
        require_object(&fields, &fp)?;
        self.ensure_structure()?;
        self.ensure_ancestors(&fp)?;

        let mut record = fields;
        let kind = ComponentKind::from_record(&record).unwrap_or_else(|| self.infer_kind(&fp));
        stamp_identity(&mut record, &fp, kind);
        write_record(&self.record_path(Some(&fp)), &record)?;
        Ok(record)
    }

    /// Merge `fields` into a component's record
    ///
    /// Objects merge key by key; array-valued fields replace the existing
    /// array wholesale.
    pub fn update_component_metadata(&self, filepath: &str, fields: Value) -> Result<Value> {
        let fp = normalize_filepath(filepath)?;
        require_object(&fields, &fp)?;
        self.ensure_structure()?;
        self.ensure_ancestors(&fp)?;

        let mut record = match self.read_component(&fp)? {
            Some(existing) => existing,
            None => skeleton(&fp, self.infer_kind(&fp)),
        };
        overlay_into(&mut record, &fields);
        let kind = ComponentKind::from_record(&record).unwrap_or_else(|| self.infer_kind(&fp));
        stamp_identity(&mut record, &fp, kind);
        write_record(&self.record_path(Some(&fp)), &record)?;
        Ok(record)
    }

    /// Merge `fields` into the resource-level record
    ///
    /// A `components` field is ignored; components are described one by one.
    pub fn update_resource_metadata(&self, fields: Value) -> Result<Value> {
        require_object(&fields, "resource")?;
        self.ensure_structure()?;

        let path = self.record_path(None);
        let mut record = read_record(&path)?.unwrap_or_else(|| json!({ "@type": [RESOURCE_TYPE] }));
        let mut fields = fields;
        if let Value::Object(map) = &mut fields {
            if map.remove("components").is_some() {
                warn!("Ignoring 'components' in resource-level update");
            }
        }
        overlay_into(&mut record, &fields);
        write_record(&path, &record)?;
        Ok(record)
    }

    /// Attach an annotation overlay to a component (or the resource with `None`)
    pub fn set_annotation(&self, filepath: Option<&str>, annotation: Value) -> Result<()> {
        let fp = filepath.map(normalize_filepath).transpose()?;
        require_object(&annotation, fp.as_deref().unwrap_or("resource"))?;
        if let Some(fp) = &fp {
            if !self.record_path(Some(fp)).exists() {
                return Err(BagError::NotFound(format!("component {}", fp)));
            }
        }
        write_record(&self.annotation_path(fp.as_deref()), &annotation)
    }

    /// The identifier recorded on the resource, if any
    pub fn identifier(&self) -> Result<Option<String>> {
        Ok(read_record(&self.record_path(None))?
            .and_then(|r| r.get("@id").and_then(Value::as_str).map(str::to_string))
            .filter(|id| !id.is_empty()))
    }

    /// Mint and record the resource identifier, exactly once
    ///
    /// If the resource already carries an `@id`, that id is returned and the
    /// minter is not consulted.
    pub fn assign_identifier(&self, seed: &str) -> Result<String> {
        self.ensure_structure()?;
        if let Some(existing) = self.identifier()? {
            debug!("Bag {:?} already identified as {}", self.root, existing);
            return Ok(existing);
        }

        let minter = self.minter.as_ref().ok_or_else(|| {
            BagError::Configuration("no identifier minter configured for this builder".into())
        })?;
        let id = minter.mint(seed)?;
        if !minter.validate_syntax(&id) {
            return Err(BagError::invalid(format!(
                "minted identifier '{}' failed syntax validation",
                id
            )));
        }

        self.update_resource_metadata(json!({ "@id": id }))?;
        info!("Assigned {} to bag {:?}", id, self.root);
        Ok(id)
    }

    /// Hash the whole of `data/<filepath>` and record checksum and size
    pub fn compute_checksum(&self, filepath: &str) -> Result<Checksum> {
        let fp = normalize_filepath(filepath)?;
        let path = self.data_dir().join(&fp);
        if !path.is_file() {
            return Err(BagError::NotFound(format!("data file {}", fp)));
        }

        let (hash, size) = sha256_file(&path)?;
        let checksum = Checksum::sha256(hash);
        self.update_component_metadata(
            &fp,
            json!({ "checksum": checksum_value(&checksum), "size": size }),
        )?;
        Ok(checksum)
    }

    /// Delete a component's data and metadata
    ///
    /// With `trim_empty_ancestors`, folders left without any component are
    /// removed too, walking up until a non-empty one is found. Returns false
    /// if nothing was there.
    pub fn remove_component(&self, filepath: &str, trim_empty_ancestors: bool) -> Result<bool> {
        let fp = normalize_filepath(filepath)?;
        let mut removed = false;

        let data = self.data_dir().join(&fp);
        if data.is_dir() {
            fs::remove_dir_all(&data).ctx("remove subcollection data", &data)?;
            removed = true;
        } else if data.exists() {
            fs::remove_file(&data).ctx("remove data file", &data)?;
            removed = true;
        }

        let meta = self.metadata_dir().join(&fp);
        if meta.is_dir() {
            fs::remove_dir_all(&meta).ctx("remove component metadata", &meta)?;
            removed = true;
        }

        if trim_empty_ancestors {
            for ancestor in ancestors(&fp).iter().rev() {
                if !self.is_empty_folder(ancestor)? {
                    break;
                }
                let data = self.data_dir().join(ancestor);
                if data.is_dir() {
                    fs::remove_dir(&data).ctx("trim empty folder", &data)?;
                }
                let meta = self.metadata_dir().join(ancestor);
                if meta.is_dir() {
                    fs::remove_dir_all(&meta).ctx("trim folder metadata", &meta)?;
                }
                debug!("Trimmed empty subcollection {}", ancestor);
            }
        }

        if removed {
            debug!("Removed component {}", fp);
        }
        Ok(removed)
    }

    fn is_empty_folder(&self, fp: &str) -> Result<bool> {
        let data = self.data_dir().join(fp);
        if data.is_dir() && fs::read_dir(&data).ctx("list folder", &data)?.next().is_some() {
            return Ok(false);
        }
        let meta = self.metadata_dir().join(fp);
        if meta.is_dir() {
            for entry in fs::read_dir(&meta).ctx("list folder metadata", &meta)? {
                let entry = entry.ctx("list folder metadata", &meta)?;
                let name = entry.file_name();
                if name != RECORD_FILE && name != ANNOT_FILE {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Write the payload manifest, tag files and tag manifest
    ///
    /// Before anything is written, every payload file must have a record
    /// whose checksum and size match the file, every described file must exist,
    /// and the optional metadata validator must pass. All problems are
    /// reported together.
    pub fn finalize(&self) -> Result<FinalizeReport> {
        self.ensure_structure()?;

        let mut problems = Vec::new();
        let mut entries = Vec::new();
        let mut oxum = PayloadOxum::default();
        let data_prefix = format!("{}/", DATA_DIR);

        for rel in list_files(&self.root, &self.data_dir())? {
            let fp = rel.strip_prefix(&data_prefix).unwrap_or(&rel).to_string();
            let (hash, size) = sha256_file(&self.root.join(&rel))?;
            oxum.add(size);

            match self.read_component(&fp)? {
                None => problems.push(format!("{}: no descriptive record", fp)),
                Some(record) => {
                    match Checksum::from_record(&record) {
                        None => problems.push(format!("{}: record has no checksum", fp)),
                        Some(cs) if cs.hash != hash => problems.push(format!(
                            "{}: checksum mismatch (file {}, record {})",
                            fp, hash, cs.hash
                        )),
                        Some(_) => {}
                    }
                    match record.get("size").and_then(Value::as_u64) {
                        None => problems.push(format!("{}: record has no size", fp)),
                        Some(recorded) if recorded != size => problems.push(format!(
                            "{}: size mismatch (file {}, record {})",
                            fp, size, recorded
                        )),
                        Some(_) => {}
                    }
                }
            }
            entries.push(ManifestEntry::new(hash, rel));
        }

        for fp in component_filepaths(&self.root)? {
            let described_as_file = self
                .read_component(&fp)?
                .and_then(|r| ComponentKind::from_record(&r))
                .map_or(false, |k| k.is_file());
            if described_as_file && !self.data_dir().join(&fp).is_file() {
                problems.push(format!("{}: described but missing from {}/", fp, DATA_DIR));
            }
        }

        if let Some(validator) = &self.validator {
            let record = PackageReader::new(&self.root).assemble()?;
            if let Err(reasons) = validator.validate(&record) {
                problems.extend(reasons.into_iter().map(|r| format!("metadata: {}", r)));
            }
        }

        if !problems.is_empty() {
            warn!(
                "Finalizing {:?} found {} problem(s)",
                self.root,
                problems.len()
            );
            return Err(BagError::Validation(problems));
        }

        write_manifest(&self.root.join(MANIFEST_FILE), &entries)?;
        write_bagit_declaration(&self.root)?;

        let info_path = self.root.join(BAG_INFO_FILE);
        let mut info = if info_path.exists() {
            TagFile::read(&info_path)?
        } else {
            TagFile::new()
        };
        info.set("Bagging-Date", chrono::Utc::now().format("%Y-%m-%d").to_string());
        info.set("Bag-Size", format_bag_size(oxum.octets));
        info.set("Payload-Oxum", oxum.to_string());
        if let Some(id) = self.identifier()? {
            info.set("External-Identifier", id);
        }
        info.write(&info_path)?;

        let tag_entries = write_tag_manifest(&self.root)?;

        info!(
            "Finalized bag {:?}: {} payload file(s), {}",
            self.root,
            entries.len(),
            format_bag_size(oxum.octets)
        );
        Ok(FinalizeReport {
            payload: oxum,
            manifest_entries: entries.len(),
            tag_entries: tag_entries.len(),
        })
    }

    fn read_component(&self, fp: &str) -> Result<Option<Value>> {
        read_record(&self.record_path(Some(fp)))
    }

    fn infer_kind(&self, fp: &str) -> ComponentKind {
        if self.data_dir().join(fp).is_dir() {
            ComponentKind::Subcollection
        } else {
            ComponentKind::for_file(fp)
        }
    }
}

fn require_object(value: &Value, what: &str) -> Result<()> {
    if value.is_object() {
        Ok(())
    } else {
        Err(BagError::invalid(format!(
            "metadata for {} must be a JSON object",
            what
        )))
    }
}

/// Minimal record for a new component
fn skeleton(fp: &str, kind: ComponentKind) -> Value {
    json!({
        "@id": component_id(fp),
        "@type": kind.type_tags(),
        "filepath": fp,
    })
}

/// Force `@id`, `filepath` and (if absent) `@type` to agree with the path
fn stamp_identity(record: &mut Value, fp: &str, kind: ComponentKind) {
    if let Value::Object(map) = record {
        map.insert("@id".into(), json!(component_id(fp)));
        map.insert("filepath".into(), json!(fp));
        map.entry("@type").or_insert_with(|| json!(kind.type_tags()));
    }
}

pub(crate) fn read_record(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path).ctx("read record", path)?;
    Ok(Some(serde_json::from_str(&text)?))
}

/// Replace a record atomically (write beside it, then rename)
pub(crate) fn write_record(path: &Path, record: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ctx("create record directory", parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(record)?).ctx("write record", &tmp)?;
    fs::rename(&tmp, path).ctx("replace record", path)?;
    Ok(())
}
