//! Run command - execute the test suite in an ephemeral namespace
//!
//! Provisions the namespace, access objects and test Job, prints the test
//! container's output to stdout as it arrives, and removes everything when
//! the Job finishes or the run is interrupted.

use std::sync::Arc;

use clap::Args;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};

use ket_common::kube_utils::create_client;
use ket_job::{
    ExecutionResult, FailurePhase, KubeApplier, KubeWorkloadSource, Launcher, RunConfig,
};

use super::{build_context, ClusterArgs};
use crate::config::ConfigArgs;
use crate::{Error, Result};

/// Run tests in a fresh namespace
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub cluster: ClusterArgs,
}

/// Execute one run with an already resolved config
pub async fn run(args: RunArgs, config: RunConfig, cancel: CancellationToken) -> Result<()> {
    let ctx = build_context(&config)?;
    let client = create_client(args.cluster.kubeconfig.as_deref(), args.cluster.context.as_deref()).await?;

    info!(
        namespace = %ctx.namespace,
        image = %config.image,
        project_root = %config.project_root,
        "starting test run"
    );

    let span = info_span!("run", namespace = %ctx.namespace);
    let launcher = Launcher::new(
        config,
        Arc::new(KubeApplier::new(client.clone())),
        Arc::new(KubeWorkloadSource::new(client)),
        span,
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_lines(rx));

    let result = launcher.run(&ctx, &tx, &cancel).await;

    // closing the channel lets the printer finish
    drop(tx);
    match printer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "failed to write test output"),
        Err(e) => warn!(error = %e, "output task panicked"),
    }

    if result.success {
        info!(namespace = %ctx.namespace, "tests passed");
        return Ok(());
    }
    Err(failure(result))
}

/// Turn a failed run into an error naming the phase that broke
fn failure(result: ExecutionResult) -> Error {
    match result.error {
        Some(e) => Error::run_failed(
            result.phase.unwrap_or(FailurePhase::Execution),
            e,
            result.exit_code,
        ),
        None => Error::command_failed("tests failed"),
    }
}

/// Copy workload output lines to stdout
async fn print_lines(mut rx: mpsc::UnboundedReceiver<String>) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = rx.recv().await {
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_failures_are_reported_as_such() {
        let result = ExecutionResult::provisioning_failed(ket_common::Error::cancelled("access"));
        let err = failure(result);
        assert!(matches!(err, Error::Provisioning(_)));
        assert_eq!(err.to_string(), "provisioning failed: run cancelled during access");
    }

    #[test]
    fn test_failures_carry_the_exit_code() {
        let result = ExecutionResult::failed(ket_common::Error::WorkloadExit {
            job: "ket-api".to_string(),
            exit_code: 3,
        });
        let err = failure(result);
        assert_eq!(
            err.to_string(),
            "test execution failed: job ket-api exited non-zero (exit code 3)"
        );
        assert_eq!(err.exit_code(), 3);
    }
}
