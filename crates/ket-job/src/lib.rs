//! Ephemeral test runs on Kubernetes
//!
//! A run provisions a fresh namespace, grants a test runner service account
//! the access it needs, launches one test Job, streams its logs while waiting
//! for it to finish, and then removes everything it created:
//! - [`rbac`]: default and supplemental access rules
//! - [`naming`]: namespace and workload names
//! - [`manifest`]: typed manifests for every object of a run
//! - [`apply`]: idempotent create/delete against the cluster
//! - [`observer`]: log streaming and Job status polling
//! - [`launcher`]: lifecycle and guaranteed cleanup

#![deny(missing_docs)]

pub mod apply;
pub mod config;
pub mod launcher;
pub mod manifest;
pub mod naming;
pub mod observer;
pub mod rbac;

pub use apply::{KubeApplier, ResourceApplier};
pub use config::{AccessScope, RunConfig};
pub use launcher::{Launcher, ResourceTracker, RunPhase};
pub use manifest::{build_run_manifests, BuildContext, Manifest, RunIdentity, RunManifests};
pub use observer::{
    ExecutionObserver, ExecutionResult, FailurePhase, KubeWorkloadSource, WorkloadSource,
};
