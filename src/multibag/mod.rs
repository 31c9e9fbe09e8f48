//! Multibag profile: splitting a finished bag into size-bounded members
//!
//! Every split produces one head member carrying `multibag/` (the member list
//! and the path→member lookup index) plus every descriptive and control file.
//! Content members carry only payload.

pub mod naming;
pub mod splitter;

pub use naming::{latest, next_sequence, select_version, BagName};
pub use splitter::{plan_shards, verify_complete, PlannedFile, SplitOutcome, SplitPlan, Splitter};

/// Tag placed between the release version and the profile version in names
pub const PROFILE_TAG: &str = "mbag";

pub const MEMBER_BAGS_FILE: &str = "member-bags.tsv";
pub const FILE_LOOKUP_FILE: &str = "file-lookup.tsv";
pub const DEPRECATED_INFO_FILE: &str = "deprecated-info.txt";
