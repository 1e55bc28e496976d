//! CLI commands

use std::path::PathBuf;

use clap::Args;
use tracing::debug;

use ket_job::naming::generate_namespace;
use ket_job::{BuildContext, RunConfig};

use crate::Result;

pub mod manifest;
pub mod run;

/// Cluster connection flags
#[derive(Args, Debug, Clone, Default)]
pub struct ClusterArgs {
    /// Path to kubeconfig (defaults to KUBECONFIG, ~/.kube/config, or in-cluster)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long)]
    pub context: Option<String>,
}

/// Resolve the run namespace and host facts for a run
pub fn build_context(config: &RunConfig) -> Result<BuildContext> {
    let namespace = config
        .namespace
        .clone()
        .unwrap_or_else(|| generate_namespace(&config.namespace_prefix));
    let ctx = BuildContext::from_host(namespace)?;
    debug!(
        namespace = %ctx.namespace,
        uid = ctx.identity.uid,
        gid = ctx.identity.gid,
        "resolved run context"
    );
    Ok(ctx)
}
