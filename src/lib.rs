//! # Bagsmith - Archival Bag Building and Multibag Splitting
//!
//! `bagsmith` assembles preservation bags for published datasets and hands
//! them off to long-term storage:
//!
//! - **Package builder and reader** for BagIt-style bags carrying NERDm metadata
//! - **Multibag splitting** of oversized bags into a head bag plus members
//! - **Name sequencing** to pick the latest or a given version of a head bag
//! - **Job status** records shared safely between processes
//! - **Per-job workers** that apply queued updates and preserve on request
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bagsmith::{PackageBuilder, Result};
//! use std::path::Path;
//!
//! # fn main() -> Result<()> {
//! let builder = PackageBuilder::new("work/mds2-2106");
//! builder.ensure_structure()?;
//! builder.add_data_file("trial1/run.csv", Path::new("/tmp/run.csv"), true)?;
//! builder.update_resource_metadata(serde_json::json!({"title": "Trial data"}))?;
//!
//! let report = builder.finalize()?;
//! println!("payload {}", report.payload);
//! # Ok(())
//! # }
//! ```
//!
//! ## Splitting
//!
//! ```rust,no_run
//! use bagsmith::{Result, Splitter, SplitterConfig};
//! use std::path::Path;
//!
//! # fn main() -> Result<()> {
//! let splitter = Splitter::new(SplitterConfig::default())?;
//! let outcome = splitter.split(Path::new("work/mds2-2106"), Path::new("out"))?;
//! println!("head bag {} of {}", outcome.head_name, outcome.members.len());
//! # Ok(())
//! # }
//! ```

pub mod bag;
pub mod config;
pub mod error;
pub mod external;
pub mod ident;
pub mod lock;
pub mod multibag;
pub mod service;
pub mod status;
pub mod worker;

pub use bag::{Checksum, FinalizeReport, PackageBuilder, PackageReader, TagFile};
pub use config::{BaggerConfig, LinkFallback, MinterSettings, SplitterConfig};
pub use error::{BagError, Result};
pub use external::{Deliverer, DirectoryDeliverer, FinishedPackage, MetadataValidator};
pub use ident::{CheckCharMinter, IdMinter};
pub use lock::{FileLockManager, NamedLock};
pub use multibag::{BagName, SplitOutcome, SplitPlan, Splitter};
pub use service::BaggingService;
pub use status::{JobState, JobStatus, StatusExport, StatusSnapshot};
pub use worker::{BaggingWorker, HandOff, UpdateApplier, UpdateQueue};
