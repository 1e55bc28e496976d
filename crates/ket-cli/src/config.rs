//! Run configuration from a YAML file and command line flags
//!
//! Resolution order (highest priority first):
//! 1. Explicit flag (or its `KET_*` environment variable)
//! 2. `--config` YAML file
//! 3. Built-in defaults

use std::path::{Path, PathBuf};

use clap::Args;

use ket_job::{AccessScope, RunConfig};

use crate::{Error, Result};

/// Flags shared by every command that describes a run
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// YAML file with run settings; flags override its values
    #[arg(short = 'f', long = "config", env = "KET_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Project directory relative to the workspace
    #[arg(long, env = "KET_PROJECT_ROOT")]
    pub project_root: Option<String>,

    /// Container image that runs the tests
    #[arg(long, env = "KET_IMAGE")]
    pub image: Option<String>,

    /// Shell command that runs the tests
    #[arg(long, env = "KET_TEST_COMMAND")]
    pub test_command: Option<String>,

    /// Seconds before the Job is killed
    #[arg(long, env = "KET_ACTIVE_DEADLINE_SECONDS")]
    pub active_deadline_seconds: Option<i64>,

    /// Pod retries before the Job is marked failed
    #[arg(long, env = "KET_BACKOFF_LIMIT")]
    pub backoff_limit: Option<i32>,

    /// Workspace path on the node, mounted into the test pod
    #[arg(long, env = "KET_WORKSPACE_PATH")]
    pub workspace_path: Option<String>,

    /// YAML file with extra access rules for the test runner
    #[arg(long, env = "KET_RBAC_FILE")]
    pub rbac_file: Option<PathBuf>,

    /// Use this namespace instead of generating one
    #[arg(long, env = "KET_NAMESPACE")]
    pub namespace: Option<String>,

    /// Prefix for generated namespace names
    #[arg(long, env = "KET_NAMESPACE_PREFIX")]
    pub namespace_prefix: Option<String>,

    /// Leave the namespace in place after the run
    #[arg(long, env = "KET_KEEP_NAMESPACE")]
    pub keep_namespace: bool,

    /// Verbose logging
    #[arg(long, env = "KET_DEBUG")]
    pub debug: bool,

    /// Scope of the test runner's role: cluster or namespace
    #[arg(long, env = "KET_ACCESS_SCOPE")]
    pub access_scope: Option<AccessScope>,

    /// Log stream reconnect attempts
    #[arg(long, env = "KET_STREAM_RETRY_ATTEMPTS")]
    pub stream_retry_attempts: Option<u32>,

    /// Seconds between Job status polls
    #[arg(long, env = "KET_POLL_INTERVAL_SECS")]
    pub poll_interval_secs: Option<u64>,

    /// Omit module names from log lines
    #[arg(long)]
    pub no_log_prefix: bool,

    /// Omit timestamps from log lines
    #[arg(long)]
    pub no_log_timestamp: bool,
}

impl ConfigArgs {
    /// Load the config file (if any), apply flag overrides and validate
    pub fn resolve(&self) -> Result<RunConfig> {
        let base = match &self.config_file {
            Some(path) => load_file(path)?,
            None => RunConfig::default(),
        };
        let config = self.apply(base);
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, mut config: RunConfig) -> RunConfig {
        if let Some(v) = &self.project_root {
            config.project_root = v.clone();
        }
        if let Some(v) = &self.image {
            config.image = v.clone();
        }
        if let Some(v) = &self.test_command {
            config.test_command = v.clone();
        }
        if let Some(v) = self.active_deadline_seconds {
            config.active_deadline_seconds = v;
        }
        if let Some(v) = self.backoff_limit {
            config.backoff_limit = v;
        }
        if let Some(v) = &self.workspace_path {
            config.workspace_path = v.clone();
        }
        if let Some(v) = &self.rbac_file {
            config.rbac_file = Some(v.clone());
        }
        if let Some(v) = &self.namespace {
            config.namespace = Some(v.clone());
        }
        if let Some(v) = &self.namespace_prefix {
            config.namespace_prefix = v.clone();
        }
        if let Some(v) = self.access_scope {
            config.access_scope = v;
        }
        if let Some(v) = self.stream_retry_attempts {
            config.stream_retry_attempts = v;
        }
        if let Some(v) = self.poll_interval_secs {
            config.poll_interval_secs = v;
        }
        // switches can only turn things on
        config.keep_namespace |= self.keep_namespace;
        config.debug |= self.debug;
        if self.no_log_prefix {
            config.logging.prefix = false;
        }
        if self.no_log_timestamp {
            config.logging.timestamp = false;
        }
        config
    }
}

fn load_file(path: &Path) -> Result<RunConfig> {
    let contents = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| Error::ConfigParse {
        path: path.to_path_buf(),
        source,
    })
}
