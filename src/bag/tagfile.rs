//! `key: value` tag files (`bagit.txt`, `bag-info.txt`, ...)
//!
//! Lines starting with whitespace continue the previous value; repeated keys
//! accumulate their values in file order.

use crate::error::{IoContext, Result};
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFile {
    entries: Vec<(String, Vec<String>)>,
}

impl TagFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Self {
        let mut tags = TagFile::new();
        let mut last: Option<(usize, usize)> = None;

        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                match last {
                    Some((key_idx, val_idx)) => {
                        let value = &mut tags.entries[key_idx].1[val_idx];
                        if !value.is_empty() {
                            value.push(' ');
                        }
                        value.push_str(line.trim());
                    }
                    None => warn!("Tag continuation on line {} has no preceding key", lineno + 1),
                }
                continue;
            }

            match line.split_once(':') {
                Some((key, value)) => {
                    last = Some(tags.push(key.trim(), value.trim()));
                }
                None => {
                    warn!("Ignoring malformed tag line {}: {:?}", lineno + 1, line);
                    last = None;
                }
            }
        }

        tags
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).ctx("read tag file", path)?;
        Ok(Self::parse(&text))
    }

    /// Append a value, returning (key index, value index)
    fn push(&mut self, key: &str, value: &str) -> (usize, usize) {
        match self.entries.iter().position(|(k, _)| k == key) {
            Some(idx) => {
                self.entries[idx].1.push(value.to_string());
                (idx, self.entries[idx].1.len() - 1)
            }
            None => {
                self.entries.push((key.to_string(), vec![value.to_string()]));
                (self.entries.len() - 1, 0)
            }
        }
    }

    /// All values recorded for a key
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.first()).map(String::as_str)
    }

    /// Replace any values of `key` with one value
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, values)) => *values = vec![value],
            None => self.entries.push((key.to_string(), vec![value])),
        }
    }

    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        self.push(key, &value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (key, values) in &self.entries {
            for value in values {
                out.push_str(key);
                out.push_str(": ");
                // embedded newlines become continuation lines
                out.push_str(&value.replace('\n', "\n  "));
                out.push('\n');
            }
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_text()).ctx("write tag file", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuation_folds_into_previous_value() {
        let text = "Source-Organization: National Institute\n  of Standards\n\tand Technology\nContact-Name: Pat\n";
        let tags = TagFile::parse(text);
        assert_eq!(
            tags.first("Source-Organization"),
            Some("National Institute of Standards and Technology")
        );
        assert_eq!(tags.first("Contact-Name"), Some("Pat"));
    }

    #[test]
    fn test_repeated_keys_accumulate_in_order() {
        let text = "Keyword: alpha\nOther: x\nKeyword: beta\n  gamma\nKeyword: delta\n";
        let tags = TagFile::parse(text);
        assert_eq!(
            tags.get("Keyword").unwrap(),
            &["alpha".to_string(), "beta gamma".to_string(), "delta".to_string()]
        );
        assert_eq!(tags.keys().collect::<Vec<_>>(), vec!["Keyword", "Other"]);
    }

    #[test]
    fn test_value_may_contain_colons() {
        let tags = TagFile::parse("External-Identifier: ark:/88434/mds2-1234\n");
        assert_eq!(tags.first("External-Identifier"), Some("ark:/88434/mds2-1234"));
    }

    #[test]
    fn test_malformed_and_orphan_lines_skipped() {
        let tags = TagFile::parse("  orphan\nnot a tag\nKey: v\n");
        assert_eq!(tags.keys().count(), 1);
        assert_eq!(tags.first("Key"), Some("v"));
    }

    #[test]
    fn test_set_replaces_and_text_reparses() {
        let mut tags = TagFile::new();
        tags.append("A", "1");
        tags.append("A", "2");
        tags.set("A", "3");
        tags.set("B", "line one\nline two");
        let reparsed = TagFile::parse(&tags.to_text());
        assert_eq!(reparsed.get("A").unwrap(), &["3".to_string()]);
        assert_eq!(reparsed.first("B"), Some("line one line two"));
        assert_eq!(tags.remove("A"), Some(vec!["3".to_string()]));
        assert!(tags.get("A").is_none());
    }
}
