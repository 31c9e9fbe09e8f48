//! Canonical shard names and their ordering
//!
//! Canonical: `<aipid>.<version>.mbag<profile>-<seq>[.<ext>]`, e.g.
//! `mds2-2106.1_0.mbag0_4-3.zip`. Legacy names omit the release version:
//! `mds2-2106.mbag0_2-0`. Versions are written with `_` inside a name and
//! handled as dotted strings (`1.0`) everywhere else.

use super::PROFILE_TAG;
use crate::error::{BagError, Result};
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

fn canonical_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\w[\w\-]*)\.(\d+(?:_\d+)*)\.mbag(\d+_\d+)-(\d+)(?:\.(\w[\w.]*))?$")
            .unwrap_or_else(|e| panic!("canonical name pattern: {}", e))
    })
}

fn legacy_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\w[\w\-]*)\.mbag(\d+_\d+)-(\d+)(?:\.(\w[\w.]*))?$")
            .unwrap_or_else(|e| panic!("legacy name pattern: {}", e))
    })
}

/// Parsed shard name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BagName {
    pub aipid: String,
    /// Dotted release version; empty for legacy names
    pub version: String,
    /// Dotted profile version
    pub profile_version: String,
    pub sequence: u32,
    pub ext: Option<String>,
}

impl BagName {
    pub fn new(
        aipid: impl Into<String>,
        version: impl Into<String>,
        profile_version: impl Into<String>,
        sequence: u32,
    ) -> Self {
        BagName {
            aipid: aipid.into(),
            version: version.into(),
            profile_version: profile_version.into(),
            sequence,
            ext: None,
        }
    }

    pub fn with_ext(mut self, ext: impl Into<String>) -> Self {
        self.ext = Some(ext.into());
        self
    }

    /// Parse a canonical or legacy name
    pub fn parse(name: &str) -> Result<Self> {
        if let Some(caps) = canonical_pattern().captures(name) {
            return Ok(BagName {
                aipid: caps[1].to_string(),
                version: caps[2].replace('_', "."),
                profile_version: caps[3].replace('_', "."),
                sequence: parse_sequence(&caps[4], name)?,
                ext: caps.get(5).map(|m| m.as_str().to_string()),
            });
        }
        if let Some(caps) = legacy_pattern().captures(name) {
            return Ok(BagName {
                aipid: caps[1].to_string(),
                version: String::new(),
                profile_version: caps[2].replace('_', "."),
                sequence: parse_sequence(&caps[3], name)?,
                ext: caps.get(4).map(|m| m.as_str().to_string()),
            });
        }
        Err(BagError::InvalidName(format!(
            "'{}' is neither <id>.<version>.{tag}<profile>-<seq>[.<ext>] nor <id>.{tag}<profile>-<seq>[.<ext>]",
            name,
            tag = PROFILE_TAG
        )))
    }

    pub fn is_legacy(&self) -> bool {
        self.version.is_empty()
    }

    /// Same name with another sequence number and no extension
    pub fn with_sequence(&self, sequence: u32) -> Self {
        BagName {
            sequence,
            ext: None,
            ..self.clone()
        }
    }

    /// The name without its extension
    pub fn stem(&self) -> String {
        let profile = self.profile_version.replace('.', "_");
        if self.is_legacy() {
            format!("{}.{}{}-{}", self.aipid, PROFILE_TAG, profile, self.sequence)
        } else {
            format!(
                "{}.{}.{}{}-{}",
                self.aipid,
                self.version.replace('.', "_"),
                PROFILE_TAG,
                profile,
                self.sequence
            )
        }
    }
}

fn parse_sequence(digits: &str, name: &str) -> Result<u32> {
    digits
        .parse()
        .map_err(|_| BagError::InvalidName(format!("sequence number in '{}' is out of range", name)))
}

impl fmt::Display for BagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stem())?;
        if let Some(ext) = &self.ext {
            write!(f, ".{}", ext)?;
        }
        Ok(())
    }
}

impl FromStr for BagName {
    type Err = BagError;

    fn from_str(s: &str) -> Result<Self> {
        BagName::parse(s)
    }
}

/// Compare dotted versions segment by segment, numerically where possible
///
/// A version that is a prefix of another sorts first, so `""` (legacy)
/// precedes every release version.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let segments = |v: &str| -> Vec<String> {
        if v.is_empty() {
            Vec::new()
        } else {
            v.split('.').map(str::to_string).collect()
        }
    };
    let (sa, sb) = (segments(a), segments(b));
    for (x, y) in sa.iter().zip(sb.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(nx), Ok(ny)) => nx.cmp(&ny),
            _ => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    sa.len().cmp(&sb.len())
}

impl Ord for BagName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.aipid
            .cmp(&other.aipid)
            .then_with(|| self.sequence.cmp(&other.sequence))
            .then_with(|| compare_versions(&self.version, &other.version))
            .then_with(|| compare_versions(&self.profile_version, &other.profile_version))
            .then_with(|| self.ext.cmp(&other.ext))
            // numerically equal spellings ("1.0" / "1.00") still need a total order
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.profile_version.cmp(&other.profile_version))
    }
}

impl PartialOrd for BagName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The latest of the parseable names; unparseable names are skipped
pub fn latest<'a, I>(names: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    names
        .into_iter()
        .filter_map(|n| BagName::parse(n).ok().map(|parsed| (parsed, n)))
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, n)| n)
}

/// Names whose release version matches `version`
///
/// `"0"` and `"1"` select legacy names. With no exact match, trailing `.0`
/// segments are stripped one at a time and the search retried.
pub fn select_version<'a, I>(names: I, version: &str) -> Vec<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let parsed: Vec<(BagName, &str)> = names
        .into_iter()
        .filter_map(|n| BagName::parse(n).ok().map(|parsed| (parsed, n)))
        .collect();

    let mut wanted = version.replace('_', ".");
    loop {
        let target = legacy_alias(&wanted);
        let found: Vec<&str> = parsed
            .iter()
            .filter(|(p, _)| p.version == target)
            .map(|(_, n)| *n)
            .collect();
        if !found.is_empty() {
            return found;
        }
        match wanted.strip_suffix(".0") {
            Some(shorter) => wanted = shorter.to_string(),
            None => return Vec::new(),
        }
    }
}

fn legacy_alias(version: &str) -> &str {
    match version {
        "0" | "1" => "",
        other => other,
    }
}

/// One past the highest sequence number used by `aipid`, or 0
pub fn next_sequence<'a, I>(names: I, aipid: &str) -> u32
where
    I: IntoIterator<Item = &'a str>,
{
    names
        .into_iter()
        .filter_map(|n| BagName::parse(n).ok())
        .filter(|p| p.aipid == aipid)
        .map(|p| p.sequence + 1)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical() {
        let name = BagName::parse("mds2-2106.1_0.mbag0_4-3.zip").unwrap();
        assert_eq!(name.aipid, "mds2-2106");
        assert_eq!(name.version, "1.0");
        assert_eq!(name.profile_version, "0.4");
        assert_eq!(name.sequence, 3);
        assert_eq!(name.ext.as_deref(), Some("zip"));
        assert_eq!(name.to_string(), "mds2-2106.1_0.mbag0_4-3.zip");
    }

    #[test]
    fn test_parse_legacy() {
        let name = BagName::parse("mds2-2106.mbag0_2-0").unwrap();
        assert!(name.is_legacy());
        assert_eq!(name.profile_version, "0.2");
        assert_eq!(name.sequence, 0);
        assert_eq!(name.ext, None);
        assert_eq!(name.to_string(), "mds2-2106.mbag0_2-0");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "mds2-2106", "mds2-2106.1_0.mbag0_4", "x.1_0.bag0_4-1", ".mbag0_4-1"] {
            let err = BagName::parse(bad).unwrap_err();
            assert!(matches!(err, BagError::InvalidName(_)), "{}", bad);
        }
    }

    #[test]
    fn test_ordering_key() {
        let mut names = vec![
            "b.1_0.mbag0_4-0",
            "a.1_0.mbag0_4-10",
            "a.1_0.mbag0_4-2",
            "a.mbag0_2-2",
            "a.1_10.mbag0_4-2",
            "a.1_2.mbag0_4-2",
        ];
        names.sort_by_key(|n| BagName::parse(n).unwrap());
        assert_eq!(
            names,
            vec![
                "a.mbag0_2-2",
                "a.1_0.mbag0_4-2",
                "a.1_2.mbag0_4-2",
                "a.1_10.mbag0_4-2",
                "a.1_0.mbag0_4-10",
                "b.1_0.mbag0_4-0",
            ]
        );
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("1", "1.0"), Ordering::Less);
        assert_eq!(compare_versions("", "0"), Ordering::Less);
        assert_eq!(compare_versions("2.0", "2.0"), Ordering::Equal);
    }

    #[test]
    fn test_latest_skips_unparseable() {
        let names = ["a.1_0.mbag0_4-1", "junk", "a.1_0.mbag0_4-4", "a.2_0.mbag0_4-3"];
        assert_eq!(latest(names.iter().copied()), Some("a.1_0.mbag0_4-4"));
        assert_eq!(latest(["junk"].iter().copied()), None);
    }

    #[test]
    fn test_select_version_with_fallback() {
        let names = [
            "a.mbag0_2-0",
            "a.1_1.mbag0_4-1",
            "a.2.mbag0_4-2",
            "a.2.mbag0_4-3",
        ];
        let names = || names.iter().copied();

        assert_eq!(select_version(names(), "1.1"), vec!["a.1_1.mbag0_4-1"]);
        assert_eq!(select_version(names(), "2.0.0"), vec!["a.2.mbag0_4-2", "a.2.mbag0_4-3"]);
        // "1.0" strips to "1", which selects the legacy grammar
        assert_eq!(select_version(names(), "1.0"), vec!["a.mbag0_2-0"]);
        assert_eq!(select_version(names(), "0"), vec!["a.mbag0_2-0"]);
        assert!(select_version(names(), "3.1").is_empty());
    }

    #[test]
    fn test_next_sequence() {
        let names = ["a.1_0.mbag0_4-0", "a.1_0.mbag0_4-5", "b.1_0.mbag0_4-9", "junk"];
        assert_eq!(next_sequence(names.iter().copied(), "a"), 6);
        assert_eq!(next_sequence(names.iter().copied(), "c"), 0);
    }
}
