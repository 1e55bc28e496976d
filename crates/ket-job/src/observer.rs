//! Workload observation
//!
//! While the test Job runs, two activities cooperate:
//! - a poller that reads the Job status until it is terminal
//! - a streamer that follows the test container's log and forwards each line
//!
//! The poller decides the result. The streamer is best effort: dropped
//! streams are reopened with backoff, and once the Job is terminal the
//! streamer gets a short drain window to flush trailing output.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, LogParams};
use kube::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use ket_common::retry::{sleep_or_cancel, Backoff, RetryConfig};
use ket_common::{Error, Result};

use crate::manifest::CONTAINER_NAME;

/// How long the streamer may keep flushing after the Job is terminal
pub const DRAIN_WINDOW: Duration = Duration::from_secs(5);

/// Job condition reason set when `activeDeadlineSeconds` is hit
pub const REASON_DEADLINE_EXCEEDED: &str = "DeadlineExceeded";

/// Label the Job controller puts on the pods it creates
const JOB_NAME_LABEL: &str = "job-name";

/// Status of the test Job
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Not terminal yet
    Running,
    /// Job completed
    Succeeded {
        /// Exit code of the test container
        exit_code: i32,
    },
    /// Job failed
    Failed {
        /// Condition reason (e.g. `BackoffLimitExceeded`, `DeadlineExceeded`)
        reason: String,
        /// Condition message
        message: String,
        /// Exit code of the test container, if it ever terminated
        exit_code: Option<i32>,
    },
}

impl JobState {
    /// Whether the Job will not change state anymore
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Running)
    }
}

/// The pod currently backing the Job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodInfo {
    /// Pod name
    pub name: String,
    /// Pod phase (`Pending`, `Running`, `Succeeded`, `Failed`, `Unknown`)
    pub phase: String,
}

impl PodInfo {
    /// Whether the containers have not started yet
    pub fn is_pending(&self) -> bool {
        self.phase.is_empty() || self.phase == "Pending"
    }
}

/// How one log stream attempt ended
#[derive(Debug)]
pub struct LogStreamOutcome {
    /// Lines forwarded to the sink during this attempt
    pub emitted: usize,
    /// Why the stream stopped early, `None` on a clean end of stream
    pub error: Option<Error>,
}

impl LogStreamOutcome {
    /// The stream reached its end
    pub fn completed(emitted: usize) -> Self {
        Self {
            emitted,
            error: None,
        }
    }

    /// The stream broke after forwarding `emitted` lines
    pub fn interrupted(emitted: usize, error: Error) -> Self {
        Self {
            emitted,
            error: Some(error),
        }
    }
}

/// Read access to the test workload
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadSource: Send + Sync {
    /// Current state of the Job
    async fn job_state(&self, namespace: &str, job: &str) -> Result<JobState>;

    /// Most recently created pod of the Job
    async fn latest_pod(&self, namespace: &str, job: &str) -> Result<Option<PodInfo>>;

    /// Follow a container's log, forwarding lines after the first `skip`
    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        skip: usize,
        sink: &mpsc::UnboundedSender<String>,
    ) -> LogStreamOutcome;
}

/// Find a `True` Job condition of the given type
fn job_condition<'a>(
    job: &'a Job,
    type_: &str,
) -> Option<&'a k8s_openapi::api::batch::v1::JobCondition> {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == type_ && c.status == "True")
        })
}

/// Exit code of a terminated container in a pod
pub fn container_exit_code(pod: &Pod, container: &str) -> Option<i32> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|s| s.name == container))
        .and_then(|s| {
            s.state
                .as_ref()
                .and_then(|state| state.terminated.as_ref())
                .or_else(|| {
                    s.last_state
                        .as_ref()
                        .and_then(|state| state.terminated.as_ref())
                })
        })
        .map(|t| t.exit_code)
}

/// Derive the [`JobState`] from Job conditions and the exit code of the
/// latest pod's test container
pub fn job_state_from(job: &Job, exit_code: Option<i32>) -> JobState {
    if job_condition(job, "Complete").is_some() {
        return JobState::Succeeded {
            exit_code: exit_code.unwrap_or(0),
        };
    }
    match job_condition(job, "Failed") {
        Some(condition) => JobState::Failed {
            reason: condition.reason.clone().unwrap_or_default(),
            message: condition.message.clone().unwrap_or_default(),
            exit_code,
        },
        None => JobState::Running,
    }
}

/// Pod with the newest creation timestamp
fn newest_pod(pods: Vec<Pod>) -> Option<Pod> {
    pods.into_iter()
        .max_by(|a, b| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
        })
}

/// [`WorkloadSource`] backed by the cluster API
pub struct KubeWorkloadSource {
    client: Client,
}

impl KubeWorkloadSource {
    /// Create a source using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn newest_job_pod(&self, namespace: &str, job: &str) -> Result<Option<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(&format!("{}={}", JOB_NAME_LABEL, job)))
            .await?;
        Ok(newest_pod(list.items))
    }
}

#[async_trait]
impl WorkloadSource for KubeWorkloadSource {
    async fn job_state(&self, namespace: &str, job: &str) -> Result<JobState> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let current = jobs.get(job).await?;

        let state = job_state_from(&current, None);
        if !state.is_terminal() {
            return Ok(state);
        }

        let exit_code = self
            .newest_job_pod(namespace, job)
            .await?
            .and_then(|pod| container_exit_code(&pod, CONTAINER_NAME));
        Ok(job_state_from(&current, exit_code))
    }

    async fn latest_pod(&self, namespace: &str, job: &str) -> Result<Option<PodInfo>> {
        Ok(self.newest_job_pod(namespace, job).await?.map(|pod| PodInfo {
            name: pod.metadata.name.clone().unwrap_or_default(),
            phase: pod
                .status
                .and_then(|s| s.phase)
                .unwrap_or_default(),
        }))
    }

    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        skip: usize,
        sink: &mpsc::UnboundedSender<String>,
    ) -> LogStreamOutcome {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            follow: true,
            ..Default::default()
        };

        let reader = match pods.log_stream(pod, &params).await {
            Ok(reader) => reader,
            Err(e) => return LogStreamOutcome::interrupted(0, Error::stream(pod, e.to_string())),
        };

        let lines = reader.lines();
        futures::pin_mut!(lines);

        let mut seen = 0usize;
        let mut emitted = 0usize;
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    seen += 1;
                    if seen <= skip {
                        continue;
                    }
                    if sink.send(line).is_err() {
                        // receiver gone, nobody is listening anymore
                        return LogStreamOutcome::completed(emitted);
                    }
                    emitted += 1;
                }
                Err(e) => {
                    return LogStreamOutcome::interrupted(emitted, Error::stream(pod, e.to_string()))
                }
            }
        }
        LogStreamOutcome::completed(emitted)
    }
}

/// Part of a run that failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePhase {
    /// Creating the namespace, access objects or Job
    Provisioning,
    /// Running and observing the test Job
    Execution,
}

impl std::fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => f.write_str("provisioning"),
            Self::Execution => f.write_str("test execution"),
        }
    }
}

/// Final outcome of a run
#[derive(Debug)]
pub struct ExecutionResult {
    /// Whether the tests passed
    pub success: bool,
    /// Exit code of the test container, when known
    pub exit_code: Option<i32>,
    /// Why the run did not succeed
    pub error: Option<Error>,
    /// Where the run failed, `None` on success
    pub phase: Option<FailurePhase>,
}

impl ExecutionResult {
    /// Successful run
    pub fn succeeded(exit_code: i32) -> Self {
        Self {
            success: true,
            exit_code: Some(exit_code),
            error: None,
            phase: None,
        }
    }

    /// Run that failed while the test Job was running or being observed
    pub fn failed(error: Error) -> Self {
        Self {
            success: false,
            exit_code: error.exit_code(),
            error: Some(error),
            phase: Some(FailurePhase::Execution),
        }
    }

    /// Run that failed before the test Job was observed
    pub fn provisioning_failed(error: Error) -> Self {
        Self {
            success: false,
            exit_code: None,
            error: Some(error),
            phase: Some(FailurePhase::Provisioning),
        }
    }
}

/// Observation settings
#[derive(Clone, Debug)]
pub struct ObserverSettings {
    /// Time between Job status polls
    pub poll_interval: Duration,
    /// Reconnect budget for the log stream
    pub stream_retry: RetryConfig,
    /// Job deadline, reported when it is exceeded
    pub deadline_seconds: i64,
    /// Flush window after the Job is terminal
    pub drain_window: Duration,
}

/// Streams logs and waits for the test Job in one namespace
pub struct ExecutionObserver {
    source: Arc<dyn WorkloadSource>,
    namespace: String,
    settings: ObserverSettings,
}

impl ExecutionObserver {
    /// Create an observer for Jobs in `namespace`
    pub fn new(
        source: Arc<dyn WorkloadSource>,
        namespace: impl Into<String>,
        settings: ObserverSettings,
    ) -> Self {
        Self {
            source,
            namespace: namespace.into(),
            settings,
        }
    }

    /// Follow the Job until it is terminal or `cancel` fires.
    ///
    /// Log lines go to `sink` in the order the container wrote them.
    pub async fn observe(
        &self,
        job: &str,
        sink: &mpsc::UnboundedSender<String>,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let finished = CancellationToken::new();

        let stream = async {
            tokio::select! {
                _ = self.stream_until_done(job, sink, &finished, cancel) => {}
                _ = cancel.cancelled() => {
                    debug!(job = %job, "log streaming cancelled");
                }
                _ = async {
                    finished.cancelled().await;
                    tokio::time::sleep(self.settings.drain_window).await;
                } => {
                    debug!(job = %job, "log drain window elapsed");
                }
            }
        };

        let poll = async {
            let state = self.wait_for_terminal(job, cancel).await;
            finished.cancel();
            state
        };

        let (state, ()) = tokio::join!(poll, stream);

        match state {
            Ok(state) => self.to_result(job, state),
            Err(e) => ExecutionResult::failed(e),
        }
    }

    fn to_result(&self, job: &str, state: JobState) -> ExecutionResult {
        match state {
            JobState::Succeeded { exit_code } => {
                info!(job = %job, exit_code, "test job succeeded");
                ExecutionResult::succeeded(exit_code)
            }
            JobState::Failed {
                reason,
                message,
                exit_code,
            } => {
                warn!(job = %job, reason = %reason, message = %message, ?exit_code, "test job failed");
                // a pod killed at the deadline reports no exit code
                let error = if reason == REASON_DEADLINE_EXCEEDED {
                    Error::DeadlineExceeded {
                        job: job.to_string(),
                        deadline_seconds: self.settings.deadline_seconds,
                    }
                } else if let Some(exit_code) = exit_code {
                    Error::WorkloadExit {
                        job: job.to_string(),
                        exit_code,
                    }
                } else {
                    let reason = match (reason.is_empty(), message.is_empty()) {
                        (true, true) => "unknown failure".to_string(),
                        (false, true) => reason,
                        (true, false) => message,
                        (false, false) => format!("{}: {}", reason, message),
                    };
                    Error::WorkloadFailed {
                        job: job.to_string(),
                        reason,
                    }
                };
                ExecutionResult::failed(error)
            }
            // wait_for_terminal only returns terminal states
            JobState::Running => ExecutionResult::failed(Error::internal_with_context(
                "observer",
                format!("job {} reported as running after completion", job),
            )),
        }
    }

    /// Poll the Job until it is terminal.
    ///
    /// Consecutive poll failures share the stream retry budget; the last
    /// error is returned once it is used up.
    async fn wait_for_terminal(&self, job: &str, cancel: &CancellationToken) -> Result<JobState> {
        let mut backoff = Backoff::new(self.settings.stream_retry.clone());

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::cancelled("observing")),
                polled = self.source.job_state(&self.namespace, job) => polled,
            };

            let delay = match polled {
                Ok(state) if state.is_terminal() => return Ok(state),
                Ok(_) => {
                    backoff.reset();
                    self.settings.poll_interval
                }
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(job = %job, error = %e, attempt = backoff.attempts(), "failed to read job status, retrying");
                        delay.max(self.settings.poll_interval)
                    }
                    None => return Err(e),
                },
            };

            if !sleep_or_cancel(delay, cancel).await {
                return Err(Error::cancelled("observing"));
            }
        }
    }

    /// Follow the test container's log until the Job is terminal and the
    /// stream has ended, the retry budget is spent, or `cancel` fires.
    async fn stream_until_done(
        &self,
        job: &str,
        sink: &mpsc::UnboundedSender<String>,
        finished: &CancellationToken,
        cancel: &CancellationToken,
    ) {
        let mut backoff = Backoff::new(self.settings.stream_retry.clone());
        let mut current_pod: Option<String> = None;
        let mut emitted = 0usize;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let pod = match self.source.latest_pod(&self.namespace, job).await {
                Ok(Some(pod)) if !pod.is_pending() => pod,
                Ok(_) => {
                    if finished.is_cancelled() {
                        debug!(job = %job, "job finished before its pod started");
                        return;
                    }
                    if !self.wait_poll_interval(finished, cancel).await {
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    match backoff.next_delay() {
                        Some(delay) => {
                            debug!(job = %job, error = %e, "failed to find job pod, retrying");
                            if !sleep_or_cancel(delay, cancel).await {
                                return;
                            }
                        }
                        None => {
                            warn!(job = %job, error = %e, "giving up on log streaming");
                            return;
                        }
                    }
                    continue;
                }
            };

            if current_pod.as_deref() != Some(pod.name.as_str()) {
                if current_pod.is_some() {
                    info!(job = %job, pod = %pod.name, "following logs of replacement pod");
                }
                current_pod = Some(pod.name.clone());
                emitted = 0;
            }

            let outcome = self
                .source
                .stream_logs(&self.namespace, &pod.name, CONTAINER_NAME, emitted, sink)
                .await;
            emitted += outcome.emitted;
            if outcome.emitted > 0 {
                backoff.reset();
            }

            match outcome.error {
                None => {
                    if finished.is_cancelled() {
                        return;
                    }
                    // container exited but the Job is not terminal yet
                    if !self.wait_poll_interval(finished, cancel).await {
                        return;
                    }
                }
                Some(e) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(pod = %pod.name, error = %e, attempt = backoff.attempts(), "log stream interrupted, reconnecting");
                        if !sleep_or_cancel(delay, cancel).await {
                            return;
                        }
                    }
                    None => {
                        warn!(pod = %pod.name, error = %e, "log stream retries exhausted, continuing without logs");
                        return;
                    }
                },
            }
        }
    }

    /// Wait one poll interval, cut short when the Job finishes.
    ///
    /// Returns `false` when the run is cancelled.
    async fn wait_poll_interval(&self, finished: &CancellationToken, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = finished.cancelled() => true,
            _ = tokio::time::sleep(self.settings.poll_interval) => true,
        }
    }
}
