//! Manifest command - print the objects a run would create
//!
//! Uses the same builders as `ket run` but never contacts the cluster.

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use ket_job::rbac::resolve_rules;
use ket_job::{build_run_manifests, RunConfig};

use super::build_context;
use crate::config::ConfigArgs;
use crate::Result;

/// Print the manifests of a run as multi-document YAML
#[derive(Args, Debug)]
pub struct ManifestArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Write to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Render the manifests for an already resolved config
pub fn run(args: ManifestArgs, config: RunConfig) -> Result<()> {
    let yaml = render(&config)?;
    match args.output {
        Some(path) => {
            std::fs::write(&path, yaml)?;
            info!(path = %path.display(), "manifests written");
        }
        None => print!("{}", yaml),
    }
    Ok(())
}

fn render(config: &RunConfig) -> Result<String> {
    let ctx = build_context(config)?;
    let rules = resolve_rules(config.rbac_file.as_deref())?;
    Ok(build_run_manifests(config, &ctx, &rules)?.to_yaml()?)
}
