//! Error types for ket
//!
//! Errors are structured with fields to aid debugging: resource kinds and
//! names for cluster API failures, the job name for workload failures, and the
//! run phase for cancellations.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for ket operations
#[derive(Debug, Error)]
pub enum Error {
    /// Bad or missing configuration value
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
        /// The offending configuration field (e.g., "image")
        field: Option<String>,
    },

    /// The uid/gid to run the workload as could not be resolved
    #[error("identity error: {message}")]
    Identity {
        /// Description of what failed
        message: String,
    },

    /// Supplemental rule file could not be read
    #[error("failed to read rule file {}: {source}", path.display())]
    RuleRead {
        /// Path of the rule file
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Supplemental rule file is malformed
    #[error("failed to parse rule file {}: {source}", path.display())]
    RuleParse {
        /// Path of the rule file
        path: PathBuf,
        /// The underlying YAML error
        source: serde_yaml::Error,
    },

    /// Cluster API failure while creating a resource
    #[error("failed to create {kind} {name}: {source}")]
    ResourceCreate {
        /// Resource kind (e.g., "Namespace")
        kind: String,
        /// Resource name
        name: String,
        /// The underlying kube-rs error
        source: kube::Error,
    },

    /// Cluster API failure while deleting a resource
    #[error("failed to delete {kind} {name}: {source}")]
    ResourceDelete {
        /// Resource kind (e.g., "ClusterRole")
        kind: String,
        /// Resource name
        name: String,
        /// The underlying kube-rs error
        source: kube::Error,
    },

    /// Workload log stream failure
    #[error("log stream error for pod {pod}: {message}")]
    Stream {
        /// Pod whose logs were being streamed
        pod: String,
        /// Description of what failed
        message: String,
    },

    /// Workload ran past its active deadline
    #[error("job {job} exceeded its active deadline of {deadline_seconds}s")]
    DeadlineExceeded {
        /// Job name
        job: String,
        /// Configured deadline
        deadline_seconds: i64,
    },

    /// Workload completed with a non-zero exit code
    #[error("job {job} exited non-zero")]
    WorkloadExit {
        /// Job name
        job: String,
        /// Exit code of the test container
        exit_code: i32,
    },

    /// Workload failed without producing an exit code
    #[error("job {job} failed: {reason}")]
    WorkloadFailed {
        /// Job name
        job: String,
        /// Failure reason reported by the cluster
        reason: String,
    },

    /// The run was cancelled by the caller
    #[error("run cancelled during {phase}")]
    Cancelled {
        /// Phase that was interrupted (e.g., "namespace", "observing")
        phase: String,
    },

    /// Kubernetes API error outside resource create/delete
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "create_client", "observer")
        context: String,
    },
}

impl Error {
    /// Create a configuration error tied to a specific field
    pub fn config_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an identity error with the given message
    pub fn identity(msg: impl Into<String>) -> Self {
        Self::Identity {
            message: msg.into(),
        }
    }

    /// Create a resource creation error
    pub fn resource_create(
        kind: impl Into<String>,
        name: impl Into<String>,
        source: kube::Error,
    ) -> Self {
        Self::ResourceCreate {
            kind: kind.into(),
            name: name.into(),
            source,
        }
    }

    /// Create a resource deletion error
    pub fn resource_delete(
        kind: impl Into<String>,
        name: impl Into<String>,
        source: kube::Error,
    ) -> Self {
        Self::ResourceDelete {
            kind: kind.into(),
            name: name.into(),
            source,
        }
    }

    /// Create a log stream error
    pub fn stream(pod: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Stream {
            pod: pod.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error for the given phase
    pub fn cancelled(phase: impl Into<String>) -> Self {
        Self::Cancelled {
            phase: phase.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Exit code of the workload, if this error carries one
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::WorkloadExit { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Whether this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}
