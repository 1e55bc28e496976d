//! Run configuration
//!
//! `RunConfig` is everything one run needs: what to execute, where the source
//! tree lives on the node, and how to name and keep the namespace. It is
//! built by the CLI (flags over an optional YAML file) and validated before
//! anything touches the cluster.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ket_common::telemetry::LoggingConfig;
use ket_common::{Error, Result, DEFAULT_NAMESPACE_PREFIX};

use crate::naming::{is_namespace_name, to_kube_safe};

/// Default container deadline for the test Job
pub const DEFAULT_ACTIVE_DEADLINE_SECONDS: i64 = 1800;
/// Default path of the source tree on the node
pub const DEFAULT_WORKSPACE_PATH: &str = "/workspace";
/// Default log stream reconnect budget
pub const DEFAULT_STREAM_RETRY_ATTEMPTS: u32 = 5;
/// Default job status polling interval
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

/// Scope of the role granted to the test workload
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessScope {
    /// ClusterRole + ClusterRoleBinding; tests may touch other namespaces
    #[default]
    Cluster,
    /// Role + RoleBinding confined to the run namespace
    Namespace,
}

impl std::fmt::Display for AccessScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cluster => write!(f, "cluster"),
            Self::Namespace => write!(f, "namespace"),
        }
    }
}

impl std::str::FromStr for AccessScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cluster" => Ok(Self::Cluster),
            "namespace" => Ok(Self::Namespace),
            _ => Err(format!(
                "invalid access scope '{}', must be 'cluster' or 'namespace'",
                s
            )),
        }
    }
}

/// Parameters for a single test run
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RunConfig {
    /// Project directory relative to the workspace (`.` for the workspace itself)
    pub project_root: String,
    /// Container image that runs the tests
    pub image: String,
    /// Shell command executed with `/bin/sh -c`
    pub test_command: String,
    /// Job `activeDeadlineSeconds`
    pub active_deadline_seconds: i64,
    /// Job `backoffLimit`
    pub backoff_limit: i32,
    /// Path of the workspace on the node (host-mounted into the pod)
    pub workspace_path: String,
    /// Optional YAML file with extra access rules
    pub rbac_file: Option<PathBuf>,
    /// Explicit namespace name; generated from `namespace_prefix` when unset
    pub namespace: Option<String>,
    /// Prefix for generated namespace names
    pub namespace_prefix: String,
    /// Leave the namespace (and its contents) in place after the run
    pub keep_namespace: bool,
    /// Verbose logging
    pub debug: bool,
    /// Scope of the test runner's role
    pub access_scope: AccessScope,
    /// Log decoration
    pub logging: LoggingConfig,
    /// How many times a dropped log stream is reopened
    pub stream_retry_attempts: u32,
    /// Seconds between job status polls
    pub poll_interval_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            project_root: ".".to_string(),
            image: String::new(),
            test_command: String::new(),
            active_deadline_seconds: DEFAULT_ACTIVE_DEADLINE_SECONDS,
            backoff_limit: 0,
            workspace_path: DEFAULT_WORKSPACE_PATH.to_string(),
            rbac_file: None,
            namespace: None,
            namespace_prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
            keep_namespace: false,
            debug: false,
            access_scope: AccessScope::default(),
            logging: LoggingConfig::default(),
            stream_retry_attempts: DEFAULT_STREAM_RETRY_ATTEMPTS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

impl RunConfig {
    /// Check the configuration before anything is created
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(Error::config_for_field("image", "image must not be empty"));
        }
        if self.test_command.trim().is_empty() {
            return Err(Error::config_for_field(
                "testCommand",
                "test command must not be empty",
            ));
        }
        if self.active_deadline_seconds <= 0 {
            return Err(Error::config_for_field(
                "activeDeadlineSeconds",
                format!(
                    "active deadline must be positive, got {}",
                    self.active_deadline_seconds
                ),
            ));
        }
        if self.backoff_limit < 0 {
            return Err(Error::config_for_field(
                "backoffLimit",
                format!("backoff limit must not be negative, got {}", self.backoff_limit),
            ));
        }
        if self.workspace_path.trim().is_empty() {
            return Err(Error::config_for_field(
                "workspacePath",
                "workspace path must not be empty",
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(Error::config_for_field(
                "pollIntervalSecs",
                "poll interval must be at least one second",
            ));
        }
        match &self.namespace {
            Some(ns) if !is_namespace_name(ns) => {
                return Err(Error::config_for_field(
                    "namespace",
                    format!(
                        "namespace '{}' must be a lowercase DNS label (a-z, 0-9, single '-', max 63 chars)",
                        ns
                    ),
                ));
            }
            Some(_) => {}
            None => {
                if to_kube_safe(&self.namespace_prefix).is_empty() {
                    return Err(Error::config_for_field(
                        "namespacePrefix",
                        format!(
                            "namespace prefix '{}' has no usable characters",
                            self.namespace_prefix
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Job status polling interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RunConfig {
        RunConfig {
            image: "alpine:3.19".to_string(),
            test_command: "true".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = RunConfig::default();
        assert_eq!(config.project_root, ".");
        assert_eq!(config.workspace_path, "/workspace");
        assert_eq!(config.active_deadline_seconds, 1800);
        assert_eq!(config.backoff_limit, 0);
        assert_eq!(config.namespace_prefix, "kubernetes-embedded-test");
        assert_eq!(config.access_scope, AccessScope::Cluster);
        assert!(!config.keep_namespace);
    }

    #[test]
    fn valid_config_passes() {
        valid().validate().unwrap();
    }

    #[test]
    fn missing_image_is_a_config_error() {
        let config = RunConfig {
            image: "  ".to_string(),
            ..valid()
        };
        match config.validate().unwrap_err() {
            Error::Config { field, .. } => assert_eq!(field.as_deref(), Some("image")),
            other => panic!("Expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_limits() {
        let config = RunConfig {
            active_deadline_seconds: 0,
            ..valid()
        };
        assert!(config.validate().is_err());

        let config = RunConfig {
            backoff_limit: -1,
            ..valid()
        };
        assert!(config.validate().is_err());

        let config = RunConfig {
            poll_interval_secs: 0,
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_namespace_must_be_dns_label() {
        let config = RunConfig {
            namespace: Some("My_Namespace".to_string()),
            ..valid()
        };
        assert!(config.validate().is_err());

        let config = RunConfig {
            namespace: Some("ci--run".to_string()),
            ..valid()
        };
        match config.validate().unwrap_err() {
            Error::Config { field, .. } => assert_eq!(field.as_deref(), Some("namespace")),
            other => panic!("Expected Config error, got {other:?}"),
        }

        let config = RunConfig {
            namespace: Some("ci-run-42".to_string()),
            ..valid()
        };
        config.validate().unwrap();
    }

    #[test]
    fn unusable_prefix_is_rejected() {
        let config = RunConfig {
            namespace_prefix: "!!!".to_string(),
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_camel_case_yaml_with_defaults() {
        let yaml = r#"
projectRoot: backend/api
image: golang:1.22
testCommand: go test ./...
accessScope: namespace
keepNamespace: true
logging:
  timestamp: false
"#;
        let config: RunConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.project_root, "backend/api");
        assert_eq!(config.access_scope, AccessScope::Namespace);
        assert!(config.keep_namespace);
        assert!(!config.logging.timestamp);
        assert!(config.logging.prefix);
        assert_eq!(config.workspace_path, "/workspace");
    }

    #[test]
    fn access_scope_from_str() {
        assert_eq!("Cluster".parse::<AccessScope>().unwrap(), AccessScope::Cluster);
        assert_eq!(
            "namespace".parse::<AccessScope>().unwrap(),
            AccessScope::Namespace
        );
        assert!("global".parse::<AccessScope>().is_err());
    }
}
