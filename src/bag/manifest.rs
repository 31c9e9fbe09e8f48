//! Payload and tag manifests
//!
//! Manifest lines are `<hex-checksum> <relative-path>`. The payload manifest
//! lists every file under `data/`; the tag manifest lists every other file in
//! the bag except itself.

use super::checksum::sha256_file;
use super::tagfile::TagFile;
use super::{BAGIT_FILE, DATA_DIR, TAG_MANIFEST_FILE};
use crate::error::{BagError, IoContext, Result};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use walkdir::WalkDir;

/// One `<hash> <path>` line
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ManifestEntry {
    pub hash: String,
    pub path: String,
}

impl ManifestEntry {
    pub fn new(hash: impl Into<String>, path: impl Into<String>) -> Self {
        ManifestEntry {
            hash: hash.into(),
            path: path.into(),
        }
    }
}

pub fn parse_manifest(text: &str) -> Result<Vec<ManifestEntry>> {
    let mut entries = Vec::new();
    let mut problems = Vec::new();

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        match line.split_once(char::is_whitespace) {
            Some((hash, path)) if !path.trim().is_empty() => {
                entries.push(ManifestEntry::new(hash.to_ascii_lowercase(), path.trim_start()));
            }
            _ => problems.push(format!("manifest line {} is malformed: {:?}", lineno + 1, line)),
        }
    }

    if problems.is_empty() {
        Ok(entries)
    } else {
        Err(BagError::Validation(problems))
    }
}

pub fn read_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    let text = fs::read_to_string(path).ctx("read manifest", path)?;
    parse_manifest(&text)
}

/// Write entries sorted by path
pub fn write_manifest(path: &Path, entries: &[ManifestEntry]) -> Result<()> {
    let mut sorted: Vec<&ManifestEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut text = String::new();
    for entry in sorted {
        text.push_str(&entry.hash);
        text.push(' ');
        text.push_str(&entry.path);
        text.push('\n');
    }
    fs::write(path, text).ctx("write manifest", path)
}

/// `Payload-Oxum`: total payload octets and file count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PayloadOxum {
    pub octets: u64,
    pub count: u64,
}

impl PayloadOxum {
    pub fn add(&mut self, size: u64) {
        self.octets += size;
        self.count += 1;
    }
}

impl fmt::Display for PayloadOxum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.octets, self.count)
    }
}

impl FromStr for PayloadOxum {
    type Err = BagError;

    fn from_str(s: &str) -> Result<Self> {
        let (octets, count) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| BagError::invalid(format!("Payload-Oxum '{}' lacks a '.'", s)))?;
        let parse = |v: &str| {
            v.parse::<u64>()
                .map_err(|_| BagError::invalid(format!("Payload-Oxum '{}' is not numeric", s)))
        };
        Ok(PayloadOxum {
            octets: parse(octets)?,
            count: parse(count)?,
        })
    }
}

/// Human-readable size for `Bag-Size`
pub fn format_bag_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["bytes", "kB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} bytes", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Write a standard `bagit.txt` declaration
pub fn write_bagit_declaration(bag_root: &Path) -> Result<()> {
    let mut tags = TagFile::new();
    tags.set("BagIt-Version", "1.0");
    tags.set("Tag-File-Character-Encoding", "UTF-8");
    tags.write(&bag_root.join(BAGIT_FILE))
}

/// Relative `/`-separated path of `path` inside `root`
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Every regular file below `dir`, as paths relative to `root`, sorted
pub fn list_files(root: &Path, dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
            BagError::io("walk", path, e.into())
        })?;
        if entry.file_type().is_file() {
            if let Some(rel) = relative_path(root, entry.path()) {
                files.push(rel);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Rewrite `tagmanifest-sha256.txt` over every non-payload file
pub fn write_tag_manifest(bag_root: &Path) -> Result<Vec<ManifestEntry>> {
    let mut entries = Vec::new();
    for rel in list_files(bag_root, bag_root)? {
        if rel == TAG_MANIFEST_FILE || rel.starts_with(&format!("{}/", DATA_DIR)) {
            continue;
        }
        let (hash, _) = sha256_file(&bag_root.join(&rel))?;
        entries.push(ManifestEntry::new(hash, rel));
    }
    write_manifest(&bag_root.join(TAG_MANIFEST_FILE), &entries)?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest_lines() {
        let text = "abc123 data/a.txt\nDEF456  data/dir/with space.csv\n\n";
        let entries = parse_manifest(text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ManifestEntry::new("abc123", "data/a.txt"));
        assert_eq!(entries[1], ManifestEntry::new("def456", "data/dir/with space.csv"));
    }

    #[test]
    fn test_parse_manifest_collects_all_bad_lines() {
        let err = parse_manifest("justahash\nok data/x\nalsobad\n").unwrap_err();
        assert_eq!(err.problems().len(), 2);
    }

    #[test]
    fn test_write_manifest_sorted() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("manifest-sha256.txt");
        write_manifest(
            &path,
            &[ManifestEntry::new("22", "data/b"), ManifestEntry::new("11", "data/a")],
        )
        .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "11 data/a\n22 data/b\n");
    }

    #[test]
    fn test_payload_oxum() {
        let mut oxum = PayloadOxum::default();
        oxum.add(10);
        oxum.add(5);
        assert_eq!(oxum.to_string(), "15.2");
        assert_eq!("15.2".parse::<PayloadOxum>().unwrap(), oxum);
        assert!("15".parse::<PayloadOxum>().is_err());
    }

    #[test]
    fn test_format_bag_size() {
        assert_eq!(format_bag_size(512), "512 bytes");
        assert_eq!(format_bag_size(2_500_000), "2.5 MB");
    }

    #[test]
    fn test_tag_manifest_skips_payload_and_itself() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("data")).unwrap();
        fs::create_dir_all(root.join("metadata")).unwrap();
        fs::write(root.join("data/x.bin"), b"x").unwrap();
        fs::write(root.join("metadata/nerdm.json"), b"{}").unwrap();
        write_bagit_declaration(root).unwrap();

        let entries = write_tag_manifest(root).unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["bagit.txt", "metadata/nerdm.json"]);

        // rerun does not list the previous tag manifest
        let entries = write_tag_manifest(root).unwrap();
        assert_eq!(entries.len(), 2);
    }
}
