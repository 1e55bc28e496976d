//! Run lifecycle
//!
//! A run moves through
//! `Init → NamespaceCreated → AccessCreated → WorkloadCreated → Observing →
//! Terminal → CleaningUp → Done`.
//!
//! Every object is recorded in a [`ResourceTracker`] the moment its create
//! call returns, and cleanup always runs afterwards against exactly what the
//! tracker holds, whether the run succeeded, failed or was cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use ket_common::retry::RetryConfig;
use ket_common::{Error, Result};

use crate::apply::ResourceApplier;
use crate::config::RunConfig;
use crate::manifest::{
    build_job, build_namespace, build_role, build_role_binding, build_service_account,
    BuildContext, Manifest, ResourceKind, ResourceRef,
};
use crate::observer::{
    ExecutionObserver, ExecutionResult, ObserverSettings, WorkloadSource, DRAIN_WINDOW,
};
use crate::rbac::resolve_rules;

/// Upper bound on the whole cleanup pass
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a run currently is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunPhase {
    /// Nothing created yet
    Init,
    /// Namespace exists
    NamespaceCreated,
    /// Service account, role and binding exist
    AccessCreated,
    /// Test Job exists
    WorkloadCreated,
    /// Streaming logs and waiting for the Job
    Observing,
    /// Result known
    Terminal,
    /// Deleting tracked resources
    CleaningUp,
    /// Finished
    Done,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::NamespaceCreated => "namespace-created",
            Self::AccessCreated => "access-created",
            Self::WorkloadCreated => "workload-created",
            Self::Observing => "observing",
            Self::Terminal => "terminal",
            Self::CleaningUp => "cleaning-up",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// Resources created during one run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceTracker {
    /// Run namespace
    pub namespace: Option<ResourceRef>,
    /// Test runner service account
    pub service_account: Option<ResourceRef>,
    /// ClusterRole or Role
    pub role: Option<ResourceRef>,
    /// ClusterRoleBinding or RoleBinding
    pub role_binding: Option<ResourceRef>,
    /// Test Job
    pub workload: Option<ResourceRef>,
}

impl ResourceTracker {
    /// Record that `resource` exists (or may exist)
    pub fn record(&mut self, resource: ResourceRef) {
        let slot = match resource.kind {
            ResourceKind::Namespace => &mut self.namespace,
            ResourceKind::ServiceAccount => &mut self.service_account,
            ResourceKind::ClusterRole | ResourceKind::Role => &mut self.role,
            ResourceKind::ClusterRoleBinding | ResourceKind::RoleBinding => &mut self.role_binding,
            ResourceKind::Job => &mut self.workload,
        };
        *slot = Some(resource);
    }

    /// Whether any access object was created
    pub fn access_created(&self) -> bool {
        self.service_account.is_some() || self.role.is_some() || self.role_binding.is_some()
    }

    /// Whether nothing was created
    pub fn is_empty(&self) -> bool {
        self.namespace.is_none() && !self.access_created() && self.workload.is_none()
    }
}

struct RunState {
    phase: RunPhase,
    tracker: ResourceTracker,
}

impl RunState {
    fn new() -> Self {
        Self {
            phase: RunPhase::Init,
            tracker: ResourceTracker::default(),
        }
    }

    fn advance(&mut self, phase: RunPhase) {
        debug!(from = %self.phase, to = %phase, "run phase");
        self.phase = phase;
    }
}

/// Runs one test workload in its own namespace
pub struct Launcher {
    config: RunConfig,
    applier: Arc<dyn ResourceApplier>,
    source: Arc<dyn WorkloadSource>,
    span: Span,
    cleanup_timeout: Duration,
}

impl Launcher {
    /// Create a launcher; everything it logs is recorded under `span`
    pub fn new(
        config: RunConfig,
        applier: Arc<dyn ResourceApplier>,
        source: Arc<dyn WorkloadSource>,
        span: Span,
    ) -> Self {
        Self {
            config,
            applier,
            source,
            span,
            cleanup_timeout: CLEANUP_TIMEOUT,
        }
    }

    /// Override the cleanup bound
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Provision, run and observe the workload, then clean up.
    ///
    /// Workload output is forwarded line by line to `sink`. Cancelling
    /// `cancel` interrupts provisioning or observation; cleanup still runs
    /// under its own timeout.
    pub async fn run(
        &self,
        ctx: &BuildContext,
        sink: &mpsc::UnboundedSender<String>,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        async {
            let mut state = RunState::new();

            let result = match self.provision_and_observe(ctx, sink, cancel, &mut state).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(phase = %state.phase, error = %e, "provisioning failed");
                    ExecutionResult::provisioning_failed(e)
                }
            };
            state.advance(RunPhase::Terminal);

            state.advance(RunPhase::CleaningUp);
            self.cleanup(&state.tracker).await;
            state.advance(RunPhase::Done);

            result
        }
        .instrument(self.span.clone())
        .await
    }

    /// Errors are returned only before observation starts; from then on
    /// the outcome is carried by the [`ExecutionResult`].
    async fn provision_and_observe(
        &self,
        ctx: &BuildContext,
        sink: &mpsc::UnboundedSender<String>,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<ExecutionResult> {
        // Pure; fail before touching the cluster
        let job = Manifest::Job(Box::new(build_job(&self.config, ctx)?));

        let namespace = Manifest::Namespace(build_namespace(ctx));
        self.create_tracked(&namespace, "namespace", cancel, &mut state.tracker)
            .await?;
        info!(namespace = %ctx.namespace, "namespace created");
        state.advance(RunPhase::NamespaceCreated);

        let rules = resolve_rules(self.config.rbac_file.as_deref())?;
        let scope = self.config.access_scope;
        for manifest in [
            Manifest::ServiceAccount(build_service_account(ctx)),
            build_role(scope, ctx, &rules),
            build_role_binding(scope, ctx),
        ] {
            self.create_tracked(&manifest, "access", cancel, &mut state.tracker)
                .await?;
        }
        info!(scope = %scope, rules = rules.len(), "access granted");
        state.advance(RunPhase::AccessCreated);

        self.create_tracked(&job, "workload", cancel, &mut state.tracker)
            .await?;
        info!(job = %job.name(), image = %self.config.image, "test job created");
        state.advance(RunPhase::WorkloadCreated);

        state.advance(RunPhase::Observing);
        let observer = ExecutionObserver::new(
            self.source.clone(),
            ctx.namespace.clone(),
            self.observer_settings(),
        );
        Ok(observer.observe(job.name(), sink, cancel).await)
    }

    fn observer_settings(&self) -> ObserverSettings {
        ObserverSettings {
            poll_interval: self.config.poll_interval(),
            stream_retry: RetryConfig::with_max_attempts(self.config.stream_retry_attempts),
            deadline_seconds: self.config.active_deadline_seconds,
            drain_window: DRAIN_WINDOW,
        }
    }

    /// Create `manifest` and record it.
    ///
    /// A create interrupted by cancellation is recorded too: the server may
    /// have applied it, and deleting a missing object is harmless.
    async fn create_tracked(
        &self,
        manifest: &Manifest,
        phase: &str,
        cancel: &CancellationToken,
        tracker: &mut ResourceTracker,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(phase));
        }

        tokio::select! {
            biased;
            created = self.applier.create(manifest) => {
                created?;
                debug!(kind = %manifest.kind(), name = %manifest.name(), "created");
                tracker.record(manifest.resource_ref());
                Ok(())
            }
            _ = cancel.cancelled() => {
                tracker.record(manifest.resource_ref());
                Err(Error::cancelled(phase))
            }
        }
    }

    /// Delete what the tracker holds, bounded by the cleanup timeout
    async fn cleanup(&self, tracker: &ResourceTracker) {
        if tracker.is_empty() {
            debug!("nothing to clean up");
            return;
        }

        match tokio::time::timeout(self.cleanup_timeout, self.delete_tracked(tracker)).await {
            Ok(()) => info!("cleanup finished"),
            Err(_) => warn!(
                timeout_secs = self.cleanup_timeout.as_secs(),
                ?tracker,
                "cleanup timed out, some resources may remain"
            ),
        }
    }

    async fn delete_tracked(&self, tracker: &ResourceTracker) {
        // cluster-scoped access objects outlive the namespace
        for resource in [&tracker.role_binding, &tracker.role].into_iter().flatten() {
            self.delete_logged(resource).await;
        }

        let Some(namespace) = &tracker.namespace else {
            return;
        };

        if self.config.keep_namespace {
            info!(namespace = %namespace.name, "keeping namespace and test job for inspection");
            if let Some(account) = &tracker.service_account {
                self.delete_logged(account).await;
            }
            return;
        }

        if !self.delete_logged(namespace).await {
            // namespace stays, so remove what ran in it
            for resource in [&tracker.workload, &tracker.service_account]
                .into_iter()
                .flatten()
            {
                self.delete_logged(resource).await;
            }
        }
    }

    /// Returns whether the delete succeeded
    async fn delete_logged(&self, resource: &ResourceRef) -> bool {
        match self.applier.delete(resource).await {
            Ok(()) => {
                debug!(resource = %resource, "deleted");
                true
            }
            Err(e) => {
                warn!(resource = %resource, error = %e, "cleanup failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ket_common::TEST_RUNNER_NAME;

    use crate::apply::MockResourceApplier;
    use crate::config::AccessScope;
    use crate::manifest::{cluster_binding_name, RunIdentity};
    use crate::observer::{FailurePhase, JobState, MockWorkloadSource};

    const NS: &str = "kubernetes-embedded-test-0a1b2c3d";

    fn config() -> RunConfig {
        RunConfig {
            project_root: "api".to_string(),
            image: "golang:1.22".to_string(),
            test_command: "go test ./...".to_string(),
            ..Default::default()
        }
    }

    fn ctx() -> BuildContext {
        BuildContext {
            namespace: NS.to_string(),
            identity: RunIdentity { uid: 1000, gid: 1000 },
            current_dir: PathBuf::from("/src"),
        }
    }

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} happened", reason),
            reason: reason.to_string(),
            code,
        })
    }

    fn finished_source(state: JobState) -> MockWorkloadSource {
        let mut source = MockWorkloadSource::new();
        source
            .expect_job_state()
            .returning(move |_, _| Ok(state.clone()));
        source.expect_latest_pod().returning(|_, _| Ok(None));
        source
    }

    /// Applier that records deletes and fails creates/deletes of chosen kinds
    fn recording_applier(
        fail_create: Option<ResourceKind>,
        fail_delete: Option<ResourceKind>,
    ) -> (MockResourceApplier, Arc<Mutex<Vec<ResourceKind>>>, Arc<Mutex<Vec<ResourceRef>>>) {
        let created = Arc::new(Mutex::new(Vec::new()));
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let mut applier = MockResourceApplier::new();

        let c = created.clone();
        applier.expect_create().returning(move |manifest| {
            if Some(manifest.kind()) == fail_create {
                return Err(Error::resource_create(
                    manifest.kind().as_str(),
                    manifest.name(),
                    api_error(403, "Forbidden"),
                ));
            }
            c.lock().unwrap().push(manifest.kind());
            Ok(())
        });

        let d = deleted.clone();
        applier.expect_delete().returning(move |resource| {
            d.lock().unwrap().push(resource.clone());
            if Some(resource.kind) == fail_delete {
                return Err(Error::resource_delete(
                    resource.kind.as_str(),
                    resource.name.clone(),
                    api_error(500, "InternalError"),
                ));
            }
            Ok(())
        });

        (applier, created, deleted)
    }

    async fn run(
        config: RunConfig,
        applier: MockResourceApplier,
        source: MockWorkloadSource,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let launcher = Launcher::new(config, Arc::new(applier), Arc::new(source), Span::none());
        let (tx, _rx) = mpsc::unbounded_channel();
        launcher.run(&ctx(), &tx, cancel).await
    }

    fn kinds(deleted: &Arc<Mutex<Vec<ResourceRef>>>) -> Vec<ResourceKind> {
        deleted.lock().unwrap().iter().map(|r| r.kind).collect()
    }

    /// Story: a passing run creates everything in order and leaves nothing behind
    #[tokio::test(start_paused = true)]
    async fn story_successful_run_cleans_up_everything() {
        let (applier, created, deleted) = recording_applier(None, None);
        let source = finished_source(JobState::Succeeded { exit_code: 0 });

        let result = run(config(), applier, source, &CancellationToken::new()).await;

        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.phase, None);
        assert_eq!(
            *created.lock().unwrap(),
            vec![
                ResourceKind::Namespace,
                ResourceKind::ServiceAccount,
                ResourceKind::ClusterRole,
                ResourceKind::ClusterRoleBinding,
                ResourceKind::Job,
            ]
        );

        let deleted = deleted.lock().unwrap();
        assert_eq!(
            deleted.iter().map(|r| r.kind).collect::<Vec<_>>(),
            vec![
                ResourceKind::ClusterRoleBinding,
                ResourceKind::ClusterRole,
                ResourceKind::Namespace,
            ]
        );
        assert_eq!(deleted[0].name, cluster_binding_name(NS));
        assert_eq!(deleted[1].name, TEST_RUNNER_NAME);
        assert_eq!(deleted[2].name, NS);
    }

    #[tokio::test(start_paused = true)]
    async fn namespace_failure_leaves_nothing_to_clean() {
        let mut applier = MockResourceApplier::new();
        applier.expect_create().times(1).returning(|manifest| {
            Err(Error::resource_create(
                manifest.kind().as_str(),
                manifest.name(),
                api_error(403, "Forbidden"),
            ))
        });
        applier.expect_delete().never();
        let mut source = MockWorkloadSource::new();
        source.expect_job_state().never();

        let result = run(config(), applier, source, &CancellationToken::new()).await;

        assert!(!result.success);
        match result.error {
            Some(Error::ResourceCreate { kind, .. }) => assert_eq!(kind, "Namespace"),
            other => panic!("Expected ResourceCreate, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn binding_failure_cleans_up_role_and_namespace() {
        let (applier, created, deleted) =
            recording_applier(Some(ResourceKind::ClusterRoleBinding), None);
        let mut source = MockWorkloadSource::new();
        source.expect_job_state().never();

        let result = run(config(), applier, source, &CancellationToken::new()).await;

        assert!(!result.success);
        assert_eq!(result.phase, Some(FailurePhase::Provisioning));
        assert!(!created.lock().unwrap().contains(&ResourceKind::Job));
        assert_eq!(
            kinds(&deleted),
            vec![ResourceKind::ClusterRole, ResourceKind::Namespace]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_rule_file_cleans_up_namespace() {
        let (applier, created, deleted) = recording_applier(None, None);
        let config = RunConfig {
            rbac_file: Some(PathBuf::from("/nonexistent/ket-rules.yaml")),
            ..config()
        };

        let result = run(config, applier, MockWorkloadSource::new(), &CancellationToken::new()).await;

        assert!(matches!(result.error, Some(Error::RuleRead { .. })));
        assert_eq!(*created.lock().unwrap(), vec![ResourceKind::Namespace]);
        assert_eq!(kinds(&deleted), vec![ResourceKind::Namespace]);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_project_root_fails_before_provisioning() {
        let mut applier = MockResourceApplier::new();
        applier.expect_create().never();
        applier.expect_delete().never();
        let config = RunConfig {
            project_root: "///".to_string(),
            ..config()
        };

        let result = run(config, applier, MockWorkloadSource::new(), &CancellationToken::new()).await;

        assert!(matches!(result.error, Some(Error::Config { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn workload_exit_code_survives_cleanup() {
        let (applier, _, deleted) = recording_applier(None, None);
        let source = finished_source(JobState::Failed {
            reason: "BackoffLimitExceeded".to_string(),
            message: String::new(),
            exit_code: Some(2),
        });

        let result = run(config(), applier, source, &CancellationToken::new()).await;

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(2));
        assert_eq!(result.phase, Some(FailurePhase::Execution));
        assert_eq!(deleted.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_namespace_removes_access_but_keeps_job() {
        let (applier, _, deleted) = recording_applier(None, None);
        let source = finished_source(JobState::Succeeded { exit_code: 0 });
        let config = RunConfig {
            keep_namespace: true,
            ..config()
        };

        let result = run(config, applier, source, &CancellationToken::new()).await;

        assert!(result.success);
        assert_eq!(
            kinds(&deleted),
            vec![
                ResourceKind::ClusterRoleBinding,
                ResourceKind::ClusterRole,
                ResourceKind::ServiceAccount,
            ]
        );
        let deleted = deleted.lock().unwrap();
        assert_eq!(deleted[2].name, TEST_RUNNER_NAME);
        assert_eq!(deleted[2].namespace.as_deref(), Some(NS));
    }

    #[tokio::test(start_paused = true)]
    async fn namespace_delete_failure_removes_job_and_account() {
        let (applier, _, deleted) = recording_applier(None, Some(ResourceKind::Namespace));
        let source = finished_source(JobState::Succeeded { exit_code: 0 });

        let result = run(config(), applier, source, &CancellationToken::new()).await;

        // cleanup failures never override the run result
        assert!(result.success);
        assert_eq!(
            kinds(&deleted),
            vec![
                ResourceKind::ClusterRoleBinding,
                ResourceKind::ClusterRole,
                ResourceKind::Namespace,
                ResourceKind::Job,
                ResourceKind::ServiceAccount,
            ]
        );
        let deleted = deleted.lock().unwrap();
        assert_eq!(deleted[3].namespace.as_deref(), Some(NS));
    }

    #[tokio::test(start_paused = true)]
    async fn namespace_scope_uses_role_and_role_binding() {
        let (applier, created, deleted) = recording_applier(None, None);
        let source = finished_source(JobState::Succeeded { exit_code: 0 });
        let config = RunConfig {
            access_scope: AccessScope::Namespace,
            ..config()
        };

        run(config, applier, source, &CancellationToken::new()).await;

        assert!(created.lock().unwrap().contains(&ResourceKind::Role));
        assert_eq!(
            kinds(&deleted),
            vec![
                ResourceKind::RoleBinding,
                ResourceKind::Role,
                ResourceKind::Namespace,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_creates_nothing() {
        let mut applier = MockResourceApplier::new();
        applier.expect_create().never();
        applier.expect_delete().never();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run(config(), applier, MockWorkloadSource::new(), &cancel).await;

        assert_eq!(result.phase, Some(FailurePhase::Provisioning));
        match result.error {
            Some(Error::Cancelled { phase }) => assert_eq!(phase, "namespace"),
            other => panic!("Expected Cancelled, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_while_observing_still_cleans_up() {
        let (applier, _, deleted) = recording_applier(None, None);
        let mut source = MockWorkloadSource::new();
        source
            .expect_job_state()
            .returning(|_, _| Ok(JobState::Running));
        source.expect_latest_pod().returning(|_, _| Ok(None));

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            canceller.cancel();
        });

        let result = run(config(), applier, source, &cancel).await;

        assert!(result.error.as_ref().is_some_and(Error::is_cancelled));
        assert_eq!(result.phase, Some(FailurePhase::Execution));
        assert_eq!(
            kinds(&deleted),
            vec![
                ResourceKind::ClusterRoleBinding,
                ResourceKind::ClusterRole,
                ResourceKind::Namespace,
            ]
        );
    }

    /// Applier that only ever creates the namespace and hangs on deletes
    struct StalledApplier {
        deletes: Arc<Mutex<Vec<ResourceKind>>>,
    }

    #[async_trait]
    impl ResourceApplier for StalledApplier {
        async fn create(&self, manifest: &Manifest) -> Result<()> {
            if manifest.kind() == ResourceKind::Namespace {
                return Ok(());
            }
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn delete(&self, resource: &ResourceRef) -> Result<()> {
            self.deletes.lock().unwrap().push(resource.kind);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_create_is_tracked_and_cleanup_is_bounded() {
        let deletes = Arc::new(Mutex::new(Vec::new()));
        let applier = StalledApplier {
            deletes: deletes.clone(),
        };
        let launcher = Launcher::new(
            config(),
            Arc::new(applier),
            Arc::new(MockWorkloadSource::new()),
            Span::none(),
        );

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let started = tokio::time::Instant::now();
        let result = launcher.run(&ctx(), &tx, &cancel).await;

        match result.error {
            Some(Error::Cancelled { phase }) => assert_eq!(phase, "access"),
            other => panic!("Expected Cancelled, got {other:?}"),
        }
        // the namespace delete hangs, so the timeout ends cleanup before the
        // tracked service account is tried
        assert!(started.elapsed() <= Duration::from_secs(1) + CLEANUP_TIMEOUT + Duration::from_millis(10));
        assert_eq!(*deletes.lock().unwrap(), vec![ResourceKind::Namespace]);
    }

    #[test]
    fn tracker_flags() {
        let mut tracker = ResourceTracker::default();
        assert!(tracker.is_empty());
        assert!(!tracker.access_created());

        tracker.record(ResourceRef::cluster(ResourceKind::Namespace, NS));
        assert!(!tracker.is_empty());
        assert!(!tracker.access_created());

        tracker.record(ResourceRef::namespaced(ResourceKind::Role, TEST_RUNNER_NAME, NS));
        assert!(tracker.access_created());
        assert_eq!(tracker.role.as_ref().unwrap().kind, ResourceKind::Role);
    }
}
