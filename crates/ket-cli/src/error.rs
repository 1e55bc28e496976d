//! Error types for the CLI

use std::path::PathBuf;

use ket_common::telemetry::TelemetryError;
use ket_job::FailurePhase;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Exit status for a run interrupted by Ctrl-C
pub const EXIT_CANCELLED: u8 = 130;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Local IO failure, e.g. writing rendered manifests
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The `--config` file could not be read
    #[error("failed to read config file {}: {source}", path.display())]
    ConfigRead {
        /// Path given with `--config`
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// The `--config` file is not a valid run config
    #[error("invalid config file {}: {source}", path.display())]
    ConfigParse {
        /// Path given with `--config`
        path: PathBuf,
        /// The underlying YAML error
        source: serde_yaml::Error,
    },

    /// Logging could not be set up
    #[error("{0}")]
    Logging(#[from] TelemetryError),

    /// Failure outside a run, e.g. invalid config or no cluster connection
    #[error("{0}")]
    Run(#[from] ket_common::Error),

    /// The namespace, access objects or Job could not be created
    #[error("provisioning failed: {0}")]
    Provisioning(#[source] ket_common::Error),

    /// The test Job failed or could not be observed to completion
    #[error("test execution failed: {source}{}", exit_code_suffix(.exit_code))]
    Execution {
        /// What went wrong
        source: ket_common::Error,
        /// Exit code of the test container, when known
        exit_code: Option<i32>,
    },

    /// Anything else that stops a command
    #[error("command failed: {message}")]
    CommandFailed {
        /// Description of what failed
        message: String,
    },
}

fn exit_code_suffix(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!(" (exit code {})", code),
        None => String::new(),
    }
}

impl Error {
    /// Create a command failure with the given message
    pub fn command_failed(message: impl Into<String>) -> Self {
        Error::CommandFailed {
            message: message.into(),
        }
    }

    /// Wrap a failed run according to the phase it failed in
    pub fn run_failed(
        phase: FailurePhase,
        source: ket_common::Error,
        exit_code: Option<i32>,
    ) -> Self {
        match phase {
            FailurePhase::Provisioning => Error::Provisioning(source),
            FailurePhase::Execution => Error::Execution { source, exit_code },
        }
    }

    /// Process exit status for this error.
    ///
    /// A test container that exited non-zero passes its own code through;
    /// cancellation is 130; everything else is 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Run(e) | Error::Provisioning(e) | Error::Execution { source: e, .. }
                if e.is_cancelled() =>
            {
                EXIT_CANCELLED
            }
            Error::Execution { exit_code, .. } => exit_code
                .and_then(|code| u8::try_from(code).ok())
                .filter(|code| *code != 0)
                .unwrap_or(1),
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload_exit(exit_code: i32) -> Error {
        Error::run_failed(
            FailurePhase::Execution,
            ket_common::Error::WorkloadExit {
                job: "ket-api".to_string(),
                exit_code,
            },
            Some(exit_code),
        )
    }

    #[test]
    fn workload_exit_code_passes_through() {
        let err = workload_exit(42);
        assert_eq!(err.exit_code(), 42);
        assert_eq!(
            err.to_string(),
            "test execution failed: job ket-api exited non-zero (exit code 42)"
        );
    }

    #[test]
    fn out_of_range_exit_code_becomes_one() {
        assert_eq!(workload_exit(300).exit_code(), 1);
    }

    #[test]
    fn provisioning_failure_names_its_phase() {
        let err = Error::run_failed(
            FailurePhase::Provisioning,
            ket_common::Error::RuleRead {
                path: PathBuf::from("/etc/ket/rules.yaml"),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
            },
            None,
        );
        assert!(matches!(err, Error::Provisioning(_)));
        assert!(err
            .to_string()
            .starts_with("provisioning failed: failed to read rule file /etc/ket/rules.yaml"));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn deadline_is_an_execution_failure_without_exit_code() {
        let err = Error::run_failed(
            FailurePhase::Execution,
            ket_common::Error::DeadlineExceeded {
                job: "ket-api".to_string(),
                deadline_seconds: 30,
            },
            None,
        );
        assert_eq!(
            err.to_string(),
            "test execution failed: job ket-api exceeded its active deadline of 30s"
        );
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn cancellation_in_any_phase_exits_130() {
        for phase in [FailurePhase::Provisioning, FailurePhase::Execution] {
            let err = Error::run_failed(phase, ket_common::Error::cancelled("observing"), None);
            assert_eq!(err.exit_code(), EXIT_CANCELLED);
        }
        assert_eq!(
            Error::from(ket_common::Error::cancelled("namespace")).exit_code(),
            EXIT_CANCELLED
        );
        assert_eq!(Error::command_failed("boom").exit_code(), 1);
    }
}
