//! Bagsmith command line
//!
//! Finalizes, checks, splits and verifies bags, and reports job status.

use anyhow::{bail, Context};
use bagsmith::multibag::{latest, select_version, verify_complete};
use bagsmith::external::RequiredFields;
use bagsmith::{BaggerConfig, PackageBuilder, Splitter, SplitterConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bagsmith")]
#[command(about = "Build, split and track archival bags")]
struct Args {
    /// Bagger configuration file (TOML); splitter defaults apply without one
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write manifests and bag-info for a bag directory
    Finalize { bag: PathBuf },

    /// Report whether a bag exceeds the maximum bag size
    Check { bag: PathBuf },

    /// Split a bag into a head bag and members
    Split {
        bag: PathBuf,

        /// Directory that receives the member bags
        #[arg(short, long)]
        out: PathBuf,

        /// Name of the head bag this release replaces
        #[arg(long)]
        deprecates: Option<String>,
    },

    /// Confirm that a split reproduces every file of its source
    Verify { source: PathBuf, head: PathBuf },

    /// Print the status record of a job as JSON
    Status {
        id: String,

        #[arg(long)]
        status_dir: Option<PathBuf>,
    },

    /// Pick the latest head bag name (or those of one version)
    Latest {
        names: Vec<String>,

        #[arg(long)]
        version: Option<String>,
    },
}

fn splitter_config(args: &Args) -> anyhow::Result<SplitterConfig> {
    match &args.config {
        Some(path) => Ok(BaggerConfig::from_file(path)?.splitter),
        None => Ok(SplitterConfig::default()),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    match &args.command {
        Command::Finalize { bag } => {
            let mut builder = PackageBuilder::new(bag);
            if let Some(path) = &args.config {
                let config = BaggerConfig::from_file(path)?;
                builder = builder.with_link_fallback(config.link_fallback);
                if !config.required_fields.is_empty() {
                    builder = builder
                        .with_validator(Arc::new(RequiredFields::new(config.required_fields)));
                }
            }
            let report = builder
                .finalize()
                .with_context(|| format!("finalizing {}", bag.display()))?;
            println!(
                "{}: {} payload, {} manifest entries, {} tag entries",
                bag.display(),
                report.payload,
                report.manifest_entries,
                report.tag_entries
            );
        }
        Command::Check { bag } => {
            let splitter = Splitter::new(splitter_config(&args)?)?;
            let total = splitter.measure(bag)?;
            let needs = splitter.check(total);
            println!(
                "{}: {} bytes, {}",
                bag.display(),
                total,
                if needs { "needs splitting" } else { "within limits" }
            );
        }
        Command::Split { bag, out, deprecates } => {
            let mut splitter = Splitter::new(splitter_config(&args)?)?;
            if let Some(config) = &args.config {
                let config = BaggerConfig::from_file(config)?;
                splitter = splitter
                    .with_link_fallback(config.link_fallback)
                    .with_release_version(config.release_version);
            }
            if let Some(name) = deprecates {
                splitter = splitter.with_deprecated_head(name.clone());
            }
            let outcome = splitter.split(bag, out)?;
            info!("Split {} into {} member(s)", bag.display(), outcome.members.len());
            for member in &outcome.members {
                println!("{}", member.display());
            }
            println!("head: {}", outcome.head_name);
        }
        Command::Verify { source, head } => {
            verify_complete(source, head)
                .with_context(|| format!("{} does not reproduce {}", head.display(), source.display()))?;
            println!("{}: complete", head.display());
        }
        Command::Status { id, status_dir } => {
            let dir = match (status_dir, &args.config) {
                (Some(dir), _) => dir.clone(),
                (None, Some(config)) => BaggerConfig::from_file(config)?.status_dir,
                (None, None) => bail!("either --status-dir or --config is required"),
            };
            let status = bagsmith::status::read_status(&dir, id)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Latest { names, version } => {
            let names = names.iter().map(String::as_str);
            let chosen = match version {
                Some(version) => latest(select_version(names, version)),
                None => latest(names),
            };
            match chosen {
                Some(name) => println!("{}", name),
                None => bail!("no matching bag name"),
            }
        }
    }

    Ok(())
}
