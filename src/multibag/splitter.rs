//! Planning and writing multibag splits
//!
//! Planning is "neighborly" bin-packing: payload files are ordered so that files
//! in the same folder sit together (smallest first), then poured greedily into
//! members up to the target size. The head member receives every
//! non-payload file and may absorb the last content member when both fit
//! within the head bound plus slop.

use super::naming::BagName;
use super::{DEPRECATED_INFO_FILE, FILE_LOOKUP_FILE, MEMBER_BAGS_FILE};
use crate::bag::checksum::{sha256_file, verify_file, Checksum};
use crate::bag::manifest::{
    format_bag_size, list_files, read_manifest, write_bagit_declaration, write_manifest,
    write_tag_manifest, ManifestEntry, PayloadOxum,
};
use crate::bag::{
    parent_of, place_file, TagFile, BAGIT_FILE, BAG_INFO_FILE, DATA_DIR, MANIFEST_FILE,
    MULTIBAG_DIR,
};
use crate::config::{LinkFallback, SplitterConfig};
use crate::error::{BagError, IoContext, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A file scheduled for a member, by bag-relative path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub path: String,
    pub size: u64,
}

impl PlannedFile {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        PlannedFile {
            path: path.into(),
            size,
        }
    }
}

fn total(files: &[PlannedFile]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

/// Assignment of files to content members and the head
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitPlan {
    pub head: Vec<PlannedFile>,
    pub members: Vec<Vec<PlannedFile>>,
}

impl SplitPlan {
    pub fn head_size(&self) -> u64 {
        total(&self.head)
    }

    pub fn member_sizes(&self) -> Vec<u64> {
        self.members.iter().map(|m| total(m)).collect()
    }

    /// Content members plus the head
    pub fn shard_count(&self) -> usize {
        self.members.len() + 1
    }

    pub fn is_single(&self) -> bool {
        self.members.is_empty()
    }
}

/// Partition payload (`content`) and head-only files into members
///
/// All comparisons are on byte counts; only the slop factor is fractional.
pub fn plan_shards(
    mut content: Vec<PlannedFile>,
    head: Vec<PlannedFile>,
    config: &SplitterConfig,
) -> SplitPlan {
    let head_size = total(&head);
    let content_size = total(&content);
    let mut plan = SplitPlan {
        head,
        members: Vec::new(),
    };

    if head_size + content_size
        <= config.with_slop(config.head_target_size + config.target_size)
    {
        plan.head.extend(content);
        plan.head.sort_by(|a, b| a.path.cmp(&b.path));
        return plan;
    }

    content.sort_by(|a, b| {
        parent_of(&a.path)
            .cmp(parent_of(&b.path))
            .then(a.size.cmp(&b.size))
            .then_with(|| a.path.cmp(&b.path))
    });

    let mut current: Vec<PlannedFile> = Vec::new();
    let mut current_size = 0u64;
    for file in content {
        if !current.is_empty() && current_size + file.size > config.target_size {
            plan.members.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += file.size;
        current.push(file);
    }
    if !current.is_empty() {
        plan.members.push(current);
    }

    let absorb = plan
        .members
        .last()
        .map_or(false, |last| head_size + total(last) <= config.with_slop(config.head_target_size));
    if absorb {
        if let Some(last) = plan.members.pop() {
            plan.head.extend(last);
        }
    }
    plan
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileClass {
    /// Regenerated per member; never planned or indexed
    Control,
    Content,
    HeadOnly,
}

fn classify(rel: &str) -> FileClass {
    if rel.starts_with(&format!("{}/", MULTIBAG_DIR)) {
        return FileClass::Control;
    }
    if rel.starts_with(&format!("{}/", DATA_DIR)) {
        return FileClass::Content;
    }
    let top_level_control = rel == BAGIT_FILE
        || rel == BAG_INFO_FILE
        || ((rel.starts_with("manifest-") || rel.starts_with("tagmanifest-"))
            && rel.ends_with(".txt"));
    if !rel.contains('/') && top_level_control {
        FileClass::Control
    } else {
        FileClass::HeadOnly
    }
}

struct Survey {
    content: Vec<PlannedFile>,
    head: Vec<PlannedFile>,
    total: u64,
}

fn survey(bag: &Path) -> Result<Survey> {
    let mut out = Survey {
        content: Vec::new(),
        head: Vec::new(),
        total: 0,
    };
    for rel in list_files(bag, bag)? {
        let path = bag.join(&rel);
        let size = fs::metadata(&path).ctx("stat", &path)?.len();
        out.total += size;
        match classify(&rel) {
            FileClass::Control => {}
            FileClass::Content => out.content.push(PlannedFile::new(rel, size)),
            FileClass::HeadOnly => out.head.push(PlannedFile::new(rel, size)),
        }
    }
    Ok(out)
}

/// Result of [`Splitter::split`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitOutcome {
    /// False when the bag was small enough to be indexed in place
    pub split: bool,
    pub head: PathBuf,
    pub head_name: String,
    /// Every member directory, head last
    pub members: Vec<PathBuf>,
}

/// Splits finished bags into multibag members
pub struct Splitter {
    config: SplitterConfig,
    link_fallback: LinkFallback,
    base_name: Option<BagName>,
    release_version: String,
    deprecates: Option<String>,
}

impl Splitter {
    pub fn new(config: SplitterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Splitter {
            config,
            link_fallback: LinkFallback::Copy,
            base_name: None,
            release_version: "1.0".to_string(),
            deprecates: None,
        })
    }

    pub fn with_link_fallback(mut self, fallback: LinkFallback) -> Self {
        self.link_fallback = fallback;
        self
    }

    /// Name members after `name` instead of the source directory
    pub fn with_base_name(mut self, name: BagName) -> Self {
        self.base_name = Some(name);
        self
    }

    /// Release version used when the source directory name carries none
    pub fn with_release_version(mut self, version: impl Into<String>) -> Self {
        self.release_version = version.into();
        self
    }

    /// Record that the new head supersedes the head bag `name`
    pub fn with_deprecated_head(mut self, name: impl Into<String>) -> Self {
        self.deprecates = Some(name.into());
        self
    }

    pub fn config(&self) -> &SplitterConfig {
        &self.config
    }

    /// True if a bag of `total_size` bytes must be split
    pub fn check(&self, total_size: u64) -> bool {
        total_size > self.config.max_size
    }

    /// Total bytes of every file in the bag
    pub fn measure(&self, bag: &Path) -> Result<u64> {
        Ok(survey(bag)?.total)
    }

    pub fn needs_split(&self, bag: &Path) -> Result<bool> {
        Ok(self.check(self.measure(bag)?))
    }

    pub fn plan(&self, bag: &Path) -> Result<SplitPlan> {
        let survey = survey(bag)?;
        Ok(plan_shards(survey.content, survey.head, &self.config))
    }

    /// Name of the first member for `bag`
    pub fn base_name_for(&self, bag: &Path) -> Result<BagName> {
        let mut base = match &self.base_name {
            Some(name) => name.clone(),
            None => {
                let dir_name = bag.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
                    BagError::InvalidName(format!("{} has no usable name", bag.display()))
                })?;
                match BagName::parse(dir_name) {
                    Ok(name) => name,
                    Err(_) => {
                        let candidate = BagName::new(
                            dir_name,
                            self.release_version.clone(),
                            self.config.profile_version.clone(),
                            0,
                        );
                        match BagName::parse(&candidate.to_string()) {
                            Ok(parsed) if parsed.aipid == dir_name => parsed,
                            _ => {
                                return Err(BagError::InvalidName(format!(
                                    "cannot derive member names from '{}'",
                                    dir_name
                                )))
                            }
                        }
                    }
                }
            }
        };
        base.profile_version = self.config.profile_version.clone();
        base.ext = None;
        Ok(base)
    }

    /// Split `source` into members under `dest_dir`
    ///
    /// A bag within the maximum size is not copied; its lookup index is written
    /// in place and the source itself is reported as the head. Rerunning
    /// replaces previously written members. If a member would land on the
    /// source directory, the source is first moved aside and restored if
    /// anything fails.
    pub fn split(&self, source: &Path, dest_dir: &Path) -> Result<SplitOutcome> {
        if !source.is_dir() {
            return Err(BagError::NotFound(format!("bag {}", source.display())));
        }
        let base = self.base_name_for(source)?;
        let survey = survey(source)?;

        if !self.check(survey.total) {
            info!(
                "{:?} is {} (max {}); indexing in place",
                source,
                format_bag_size(survey.total),
                format_bag_size(self.config.max_size)
            );
            return self.index_in_place(source, &base, &survey);
        }

        let plan = plan_shards(survey.content, survey.head, &self.config);
        let names = member_names(&base, &plan);
        info!(
            "Splitting {:?} ({}) into {} member(s): content {:?}, head {}",
            source,
            format_bag_size(survey.total),
            plan.shard_count(),
            plan.member_sizes(),
            plan.head_size()
        );
        fs::create_dir_all(dest_dir).ctx("create split destination", dest_dir)?;

        let collides = names
            .iter()
            .any(|n| same_path(&dest_dir.join(n.to_string()), source));
        if !collides {
            let outcome = self.write_members(source, dest_dir, &names, &plan)?;
            verify_complete(source, &outcome.head)?;
            return Ok(outcome);
        }

        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BagError::State(format!("{} has no file name", source.display())))?;
        let parent = source
            .parent()
            .ok_or_else(|| BagError::State(format!("{} has no parent", source.display())))?;
        let staged = parent.join(format!(".{}.presplit", file_name));
        if staged.exists() {
            return Err(BagError::State(format!(
                "leftover staging directory {} must be resolved first",
                staged.display()
            )));
        }

        warn!("Member name collides with source; staging {:?} as {:?}", source, staged);
        fs::rename(source, &staged).ctx("stage source bag", &staged)?;

        let result = self
            .write_members(&staged, dest_dir, &names, &plan)
            .and_then(|outcome| verify_complete(&staged, &outcome.head).map(|_| outcome));
        match result {
            Ok(outcome) => {
                fs::remove_dir_all(&staged).ctx("remove staged source", &staged)?;
                Ok(outcome)
            }
            Err(e) => {
                for name in &names {
                    let partial = dest_dir.join(name.to_string());
                    if partial.exists() {
                        if let Err(cleanup) = fs::remove_dir_all(&partial) {
                            warn!("Could not remove partial member {:?}: {}", partial, cleanup);
                        }
                    }
                }
                fs::rename(&staged, source).ctx("restore source bag", source)?;
                warn!("Split of {:?} failed; source restored", source);
                Err(e)
            }
        }
    }

    fn index_in_place(&self, source: &Path, base: &BagName, survey: &Survey) -> Result<SplitOutcome> {
        let name = base.to_string();
        let lookup: Vec<(String, String)> = survey
            .content
            .iter()
            .chain(survey.head.iter())
            .map(|f| (f.path.clone(), name.clone()))
            .collect();

        let multibag = source.join(MULTIBAG_DIR);
        if multibag.exists() {
            fs::remove_dir_all(&multibag).ctx("clear lookup index", &multibag)?;
        }
        self.write_index(source, &[name.clone()], lookup)?;

        let info_path = source.join(BAG_INFO_FILE);
        let mut info = if info_path.exists() {
            TagFile::read(&info_path)?
        } else {
            TagFile::new()
        };
        self.stamp_head_info(&mut info, base, &name);
        info.write(&info_path)?;
        write_tag_manifest(source)?;

        Ok(SplitOutcome {
            split: false,
            head: source.to_path_buf(),
            head_name: name,
            members: vec![source.to_path_buf()],
        })
    }

    fn write_members(
        &self,
        source: &Path,
        dest_dir: &Path,
        names: &[BagName],
        plan: &SplitPlan,
    ) -> Result<SplitOutcome> {
        let hashes = source_hashes(source)?;
        let base_info = inherited_info(source)?;
        let head = names
            .last()
            .ok_or_else(|| BagError::State("split plan produced no head".into()))?;
        let head_name = head.to_string();

        let mut lookup = Vec::new();
        let mut written = Vec::new();
        for (files, name) in plan.members.iter().zip(names.iter()) {
            let dir = dest_dir.join(name.to_string());
            let mut info = base_info.clone();
            info.set("Multibag-Version", self.config.profile_version.clone());
            info.set("Multibag-Head-Bag", head_name.clone());
            self.write_member(source, &dir, files, &hashes, info)?;
            write_tag_manifest(&dir)?;
            lookup.extend(files.iter().map(|f| (f.path.clone(), name.to_string())));
            debug!("Wrote member {} ({} file(s))", name, files.len());
            written.push(dir);
        }

        let head_dir = dest_dir.join(&head_name);
        let mut info = base_info;
        self.stamp_head_info(&mut info, head, &head_name);
        self.write_member(source, &head_dir, &plan.head, &hashes, info)?;
        lookup.extend(plan.head.iter().map(|f| (f.path.clone(), head_name.clone())));

        let member_list: Vec<String> = names.iter().map(ToString::to_string).collect();
        self.write_index(&head_dir, &member_list, lookup)?;
        write_tag_manifest(&head_dir)?;
        written.push(head_dir.clone());

        info!("Wrote head member {} in {:?}", head_name, dest_dir);
        Ok(SplitOutcome {
            split: true,
            head: head_dir,
            head_name,
            members: written,
        })
    }

    /// Payload, manifest, `bagit.txt` and `bag-info.txt` for one member
    fn write_member(
        &self,
        source: &Path,
        dir: &Path,
        files: &[PlannedFile],
        hashes: &HashMap<String, String>,
        mut info: TagFile,
    ) -> Result<()> {
        if dir.exists() {
            fs::remove_dir_all(dir).ctx("replace member", dir)?;
        }
        fs::create_dir_all(dir.join(DATA_DIR)).ctx("create member", dir)?;

        let mut entries = Vec::new();
        let mut oxum = PayloadOxum::default();
        for file in files {
            let dest = dir.join(&file.path);
            place_file(&source.join(&file.path), &dest, self.config.prefer_links, self.link_fallback)?;
            if classify(&file.path) == FileClass::Content {
                let hash = match hashes.get(&file.path) {
                    Some(hash) => hash.clone(),
                    None => sha256_file(&dest)?.0,
                };
                entries.push(ManifestEntry::new(hash, file.path.clone()));
                oxum.add(file.size);
            }
        }

        write_manifest(&dir.join(MANIFEST_FILE), &entries)?;
        write_bagit_declaration(dir)?;
        info.set("Bagging-Date", chrono::Utc::now().format("%Y-%m-%d").to_string());
        info.set("Bag-Size", format_bag_size(oxum.octets));
        info.set("Payload-Oxum", oxum.to_string());
        info.write(&dir.join(BAG_INFO_FILE))
    }

    fn stamp_head_info(&self, info: &mut TagFile, head: &BagName, head_name: &str) {
        let version = if head.is_legacy() {
            self.release_version.clone()
        } else {
            head.version.clone()
        };
        info.set("Multibag-Version", self.config.profile_version.clone());
        info.set("Multibag-Head-Bag", head_name.to_string());
        info.set("Multibag-Head-Version", version);
        info.set("Multibag-Tag-Directory", MULTIBAG_DIR);
        if let Some(old) = &self.deprecates {
            info.set("Multibag-Head-Deprecates", old.clone());
        }
    }

    /// `multibag/` files: member list (head last), lookup and deprecation record
    fn write_index(
        &self,
        head_dir: &Path,
        members: &[String],
        mut lookup: Vec<(String, String)>,
    ) -> Result<()> {
        let dir = head_dir.join(MULTIBAG_DIR);
        fs::create_dir_all(&dir).ctx("create multibag directory", &dir)?;

        let mut text = String::new();
        for name in members {
            text.push_str(name);
            text.push('\n');
        }
        let path = dir.join(MEMBER_BAGS_FILE);
        fs::write(&path, text).ctx("write member list", &path)?;

        lookup.sort();
        let mut text = String::new();
        for (file, member) in &lookup {
            text.push_str(file);
            text.push('\t');
            text.push_str(member);
            text.push('\n');
        }
        let path = dir.join(FILE_LOOKUP_FILE);
        fs::write(&path, text).ctx("write file lookup", &path)?;

        if let Some(old) = &self.deprecates {
            let mut record = TagFile::new();
            record.set("Deprecated-Head-Bag", old.clone());
            if let Ok(parsed) = BagName::parse(old) {
                if !parsed.is_legacy() {
                    record.set("Deprecated-Head-Version", parsed.version);
                }
            }
            record.write(&dir.join(DEPRECATED_INFO_FILE))?;
        }
        Ok(())
    }
}

fn member_names(base: &BagName, plan: &SplitPlan) -> Vec<BagName> {
    (0..plan.shard_count())
        .map(|i| base.with_sequence(base.sequence + i as u32))
        .collect()
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

/// Hashes from the source's payload manifest, when it has one
fn source_hashes(source: &Path) -> Result<HashMap<String, String>> {
    let path = source.join(MANIFEST_FILE);
    if !path.exists() {
        return Ok(HashMap::new());
    }
    Ok(read_manifest(&path)?
        .into_iter()
        .map(|e| (e.path, e.hash))
        .collect())
}

/// Source `bag-info.txt` without per-member and multibag fields
fn inherited_info(source: &Path) -> Result<TagFile> {
    let path = source.join(BAG_INFO_FILE);
    let mut info = if path.exists() {
        TagFile::read(&path)?
    } else {
        TagFile::new()
    };
    let drop: Vec<String> = info
        .keys()
        .filter(|k| {
            k.starts_with("Multibag-")
                || matches!(*k, "Payload-Oxum" | "Bag-Size" | "Bagging-Date")
        })
        .map(str::to_string)
        .collect();
    for key in drop {
        info.remove(&key);
    }
    Ok(info)
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    Ok(fs::read_to_string(path)
        .ctx("read multibag index", path)?
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Confirm that the head's lookup index accounts for every source file
///
/// Each non-control file in `source` must be mapped to a listed member that
/// really holds it (and, for payload, lists it in its manifest with a digest
/// the member's copy still matches), and no payload path may appear in more
/// than one member manifest. All violations are returned together.
pub fn verify_complete(source: &Path, head: &Path) -> Result<()> {
    let index = head.join(MULTIBAG_DIR);
    let lookup_path = index.join(FILE_LOOKUP_FILE);
    let members_path = index.join(MEMBER_BAGS_FILE);
    if !lookup_path.is_file() || !members_path.is_file() {
        return Err(BagError::NotFound(format!(
            "multibag index in {}",
            head.display()
        )));
    }

    let mut problems = Vec::new();
    let mut lookup: BTreeMap<String, String> = BTreeMap::new();
    for (lineno, line) in read_lines(&lookup_path)?.into_iter().enumerate() {
        match line.split_once('\t') {
            Some((path, member)) => {
                lookup.insert(path.to_string(), member.to_string());
            }
            None => problems.push(format!("lookup line {} is malformed: {:?}", lineno + 1, line)),
        }
    }

    let members = read_lines(&members_path)?;
    let head_name = members.last().cloned().unwrap_or_default();
    let siblings = head.parent().unwrap_or_else(|| Path::new("."));
    let member_dir = |name: &str| -> PathBuf {
        if name == head_name {
            head.to_path_buf()
        } else {
            siblings.join(name)
        }
    };

    let mut manifests: HashMap<String, BTreeMap<String, String>> = HashMap::new();
    let mut claimed: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for member in &members {
        let path = member_dir(member).join(MANIFEST_FILE);
        if !path.is_file() {
            problems.push(format!("member {} has no payload manifest", member));
            continue;
        }
        let mut listed = BTreeMap::new();
        for entry in read_manifest(&path)? {
            claimed.entry(entry.path.clone()).or_default().push(member.clone());
            listed.insert(entry.path, entry.hash);
        }
        manifests.insert(member.clone(), listed);
    }
    for (path, owners) in &claimed {
        if owners.len() > 1 {
            problems.push(format!("{}: listed by more than one member ({})", path, owners.join(", ")));
        }
    }

    for rel in list_files(source, source)? {
        if classify(&rel) == FileClass::Control {
            continue;
        }
        let Some(member) = lookup.get(&rel) else {
            problems.push(format!("{}: missing from the lookup index", rel));
            continue;
        };
        if !members.contains(member) {
            problems.push(format!("{}: mapped to unlisted member {}", rel, member));
            continue;
        }
        let copy = member_dir(member).join(&rel);
        if !copy.is_file() {
            problems.push(format!("{}: not present in member {}", rel, member));
            continue;
        }
        if classify(&rel) != FileClass::Content {
            continue;
        }
        match manifests.get(member).and_then(|m| m.get(&rel)) {
            None => problems.push(format!("{}: not in the manifest of {}", rel, member)),
            Some(hash) => {
                if !verify_file(&copy, &Checksum::sha256(hash.clone()))? {
                    problems.push(format!("{}: checksum mismatch in member {}", rel, member));
                }
            }
        }
    }

    if problems.is_empty() {
        debug!("Lookup index in {:?} covers {:?}", head, source);
        Ok(())
    } else {
        warn!("Multibag verification found {} problem(s)", problems.len());
        Err(BagError::Validation(problems))
    }
}
