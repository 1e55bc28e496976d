//! Common types for ket: errors, retry, logging and Kubernetes helpers

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Prefix shared by every resource name ket creates
pub const RESOURCE_PREFIX: &str = "ket";

/// Name of the role, service account and container that run the tests
pub const TEST_RUNNER_NAME: &str = "ket-test-runner";

/// Prefix used for generated namespaces when none is configured
pub const DEFAULT_NAMESPACE_PREFIX: &str = "kubernetes-embedded-test";

/// Label key marking resources created by ket
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label value for [`LABEL_MANAGED_BY`]
pub const LABEL_MANAGED_BY_KET: &str = "ket";

/// Label key carrying the run namespace on cluster-scoped resources
pub const LABEL_RUN_NAMESPACE: &str = "ket.dev/run-namespace";

/// Environment variable carrying the run namespace into the workload
pub const ENV_TEST_NAMESPACE: &str = "KET_TEST_NAMESPACE";

/// Environment variable carrying the configured project root into the workload
pub const ENV_PROJECT_ROOT: &str = "KET_PROJECT_ROOT";

/// Environment variable carrying the configured workspace path into the workload
pub const ENV_WORKSPACE_PATH: &str = "KET_WORKSPACE_PATH";
