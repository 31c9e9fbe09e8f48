//! On-disk bag layout
//!
//! A bag is a directory with a payload tree under `data/` and a mirrored
//! descriptive tree under `metadata/`:
//!
//! ```text
//! <bag>/
//!   bagit.txt, bag-info.txt            tag files
//!   manifest-sha256.txt                payload manifest
//!   tagmanifest-sha256.txt             tag manifest
//!   data/<filepath>                    content
//!   metadata/nerdm.json                resource record
//!   metadata/annot.json                resource annotations (optional)
//!   metadata/<filepath>/nerdm.json     component record
//!   metadata/<filepath>/annot.json     component annotations (optional)
//!   multibag/                          lookup index (head bags only)
//! ```
//!
//! Component paths ("filepaths") are always relative, `/`-separated strings.
//! Ancestor walks are string-prefix operations on them.

pub mod builder;
pub mod checksum;
pub mod manifest;
pub mod merge;
pub mod reader;
pub mod tagfile;

pub use builder::{FinalizeReport, PackageBuilder};
pub use checksum::Checksum;
pub use reader::PackageReader;
pub use tagfile::TagFile;

use crate::config::LinkFallback;
use crate::error::{BagError, IoContext, Result};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tracing::debug;

pub const DATA_DIR: &str = "data";
pub const METADATA_DIR: &str = "metadata";
pub const MULTIBAG_DIR: &str = "multibag";
pub const RECORD_FILE: &str = "nerdm.json";
pub const ANNOT_FILE: &str = "annot.json";
pub const BAGIT_FILE: &str = "bagit.txt";
pub const BAG_INFO_FILE: &str = "bag-info.txt";
pub const MANIFEST_FILE: &str = "manifest-sha256.txt";
pub const TAG_MANIFEST_FILE: &str = "tagmanifest-sha256.txt";

pub const DATA_FILE_TYPE: &str = "nrdp:DataFile";
pub const CHECKSUM_FILE_TYPE: &str = "nrdp:ChecksumFile";
pub const SUBCOLL_TYPE: &str = "nrdp:Subcollection";
pub const DOWNLOADABLE_TYPE: &str = "nrdp:DownloadableFile";
pub const DISTRIBUTION_TYPE: &str = "dcat:Distribution";
pub const RESOURCE_TYPE: &str = "nrdp:PublicDataResource";

/// Kind of component a filepath names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComponentKind {
    DataFile,
    ChecksumFile,
    Subcollection,
}

impl ComponentKind {
    /// Type tags recorded in a component's `@type`
    pub fn type_tags(&self) -> Vec<&'static str> {
        match self {
            ComponentKind::DataFile => vec![DATA_FILE_TYPE, DOWNLOADABLE_TYPE, DISTRIBUTION_TYPE],
            ComponentKind::ChecksumFile => {
                vec![CHECKSUM_FILE_TYPE, DOWNLOADABLE_TYPE, DISTRIBUTION_TYPE]
            }
            ComponentKind::Subcollection => vec![SUBCOLL_TYPE],
        }
    }

    /// Infer the file kind from a filepath's extension
    pub fn for_file(filepath: &str) -> Self {
        if filepath.ends_with(".sha256") || filepath.ends_with(".md5") {
            ComponentKind::ChecksumFile
        } else {
            ComponentKind::DataFile
        }
    }

    /// Classify a record by its `@type` tags
    pub fn from_record(record: &Value) -> Option<Self> {
        let tags = record.get("@type")?.as_array()?;
        let has = |t: &str| tags.iter().any(|v| v.as_str() == Some(t));
        if has(SUBCOLL_TYPE) {
            Some(ComponentKind::Subcollection)
        } else if has(CHECKSUM_FILE_TYPE) {
            Some(ComponentKind::ChecksumFile)
        } else if has(DATA_FILE_TYPE) {
            Some(ComponentKind::DataFile)
        } else {
            None
        }
    }

    pub fn is_file(&self) -> bool {
        !matches!(self, ComponentKind::Subcollection)
    }
}

/// Normalize and check a component filepath
///
/// Strips surrounding slashes and rejects empty, `.`/`..` and reserved segments.
pub fn normalize_filepath(filepath: &str) -> Result<String> {
    let trimmed = filepath.trim_matches('/');
    if trimmed.is_empty() {
        return Err(BagError::invalid("component filepath must not be empty"));
    }

    let mut segments = Vec::new();
    for seg in trimmed.split('/') {
        match seg {
            "" => {
                return Err(BagError::invalid(format!(
                    "filepath '{}' contains an empty segment",
                    filepath
                )))
            }
            "." | ".." => {
                return Err(BagError::invalid(format!(
                    "filepath '{}' contains a relative segment",
                    filepath
                )))
            }
            RECORD_FILE | ANNOT_FILE => {
                return Err(BagError::invalid(format!(
                    "filepath '{}' uses a reserved name",
                    filepath
                )))
            }
            _ => segments.push(seg),
        }
    }

    Ok(segments.join("/"))
}

/// Every proper ancestor of a filepath, nearest-to-root first
///
/// `"a/b/c.txt"` yields `["a", "a/b"]`.
pub fn ancestors(filepath: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut end = 0;
    while let Some(pos) = filepath[end..].find('/') {
        end += pos;
        out.push(filepath[..end].to_string());
        end += 1;
    }
    out
}

/// Parent filepath, or `""` for top-level components
pub fn parent_of(filepath: &str) -> &str {
    filepath.rfind('/').map(|idx| &filepath[..idx]).unwrap_or("")
}

/// Last segment of a filepath
pub fn base_name(filepath: &str) -> &str {
    filepath.rsplit('/').next().unwrap_or(filepath)
}

/// `@id` for a component
pub fn component_id(filepath: &str) -> String {
    format!("cmps/{}", filepath)
}

/// NERDm-style checksum object
pub fn checksum_value(checksum: &Checksum) -> Value {
    json!({
        "algorithm": { "@type": "Thing", "tag": checksum.algorithm },
        "hash": checksum.hash,
    })
}

/// Media type from the file extension
pub fn media_type_for(filepath: &str) -> &'static str {
    let ext = base_name(filepath)
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") | Some("sha256") | Some("md5") => "text/plain",
        Some("csv") => "text/csv",
        Some("tsv") => "text/tab-separated-values",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("html") | Some("htm") => "text/html",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("tar") => "application/x-tar",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("tif") | Some("tiff") => "image/tiff",
        Some("h5") | Some("hdf5") => "application/x-hdf5",
        Some("nc") => "application/x-netcdf",
        _ => "application/octet-stream",
    }
}

/// Place `source` at `dest`, preferring a hard link
///
/// A failed link falls back to a full copy unless the policy is
/// [`LinkFallback::Fail`]. Any existing file at `dest` is replaced.
pub fn place_file(source: &Path, dest: &Path, prefer_link: bool, fallback: LinkFallback) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).ctx("create directory", parent)?;
    }
    if dest.exists() {
        fs::remove_file(dest).ctx("replace file", dest)?;
    }

    if prefer_link {
        match fs::hard_link(source, dest) {
            Ok(()) => return Ok(()),
            Err(e) if fallback == LinkFallback::Fail => {
                return Err(BagError::io("hard-link into", dest, e));
            }
            Err(e) => {
                debug!(
                    "Hard link {:?} -> {:?} failed ({}), copying instead",
                    source, dest, e
                );
            }
        }
    }

    fs::copy(source, dest).ctx("copy into", dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_filepath() {
        assert_eq!(normalize_filepath("/a/b/c.txt/").unwrap(), "a/b/c.txt");
        assert_eq!(normalize_filepath("x").unwrap(), "x");
        assert!(normalize_filepath("").is_err());
        assert!(normalize_filepath("/").is_err());
        assert!(normalize_filepath("a//b").is_err());
        assert!(normalize_filepath("a/../b").is_err());
        assert!(normalize_filepath("a/nerdm.json").is_err());
        assert!(matches!(
            normalize_filepath("nerdm.json/x.txt"),
            Err(BagError::Validation(_))
        ));
        assert!(normalize_filepath("a/annot.json/b").is_err());
    }

    #[test]
    fn test_ancestors_and_parent() {
        assert_eq!(ancestors("a/b/c.txt"), vec!["a".to_string(), "a/b".to_string()]);
        assert!(ancestors("top.txt").is_empty());
        assert_eq!(parent_of("a/b/c.txt"), "a/b");
        assert_eq!(parent_of("top.txt"), "");
        assert_eq!(base_name("a/b/c.txt"), "c.txt");
    }

    #[test]
    fn test_component_kind() {
        assert_eq!(ComponentKind::for_file("x/data.csv"), ComponentKind::DataFile);
        assert_eq!(ComponentKind::for_file("x/data.csv.sha256"), ComponentKind::ChecksumFile);

        let rec = json!({"@type": ["nrdp:Subcollection"]});
        assert_eq!(ComponentKind::from_record(&rec), Some(ComponentKind::Subcollection));
        let rec = json!({"@type": ComponentKind::DataFile.type_tags()});
        assert_eq!(ComponentKind::from_record(&rec), Some(ComponentKind::DataFile));
        assert_eq!(ComponentKind::from_record(&json!({})), None);
    }

    #[test]
    fn test_media_type_for() {
        assert_eq!(media_type_for("a/b.CSV"), "text/csv");
        assert_eq!(media_type_for("noext"), "application/octet-stream");
    }

    #[test]
    fn test_place_file_copies_when_linking_disabled() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, b"payload").unwrap();
        let dest = dir.path().join("deep/er/dest.bin");

        place_file(&src, &dest, false, LinkFallback::Fail).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"payload");

        // replacing an existing destination
        fs::write(&src, b"second").unwrap();
        place_file(&src, &dest, true, LinkFallback::Copy).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"second");
    }
}
