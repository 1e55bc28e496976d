//! Manifest construction for a run
//!
//! Everything here is pure: given a [`RunConfig`], a [`BuildContext`] and the
//! merged access rules, the same manifests come out every time. Host lookups
//! (uid/gid, current directory) happen once in [`BuildContext::from_host`].

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, HostPathVolumeSource, Namespace,
    PodSecurityContext, PodSpec, PodTemplateSpec, ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use kube::api::ObjectMeta;
use nix::unistd::{getgid, getuid, User};
use serde::Serialize;

use ket_common::kube_utils::managed_labels;
use ket_common::{
    Error, Result, ENV_PROJECT_ROOT, ENV_TEST_NAMESPACE, ENV_WORKSPACE_PATH,
    LABEL_RUN_NAMESPACE, TEST_RUNNER_NAME,
};

use crate::config::{AccessScope, RunConfig};
use crate::naming::{is_current_dir, project_id, workload_name};
use crate::rbac::AccessRule;

/// Name of the container that runs the test command
pub const CONTAINER_NAME: &str = "test-runner";
/// Mount point of the source tree inside the container
pub const SOURCE_MOUNT_PATH: &str = "/workspace";
/// Mount point of the scratch reports volume inside the container
pub const REPORTS_MOUNT_PATH: &str = "/reports";

const SOURCE_VOLUME: &str = "source-code";
const REPORTS_VOLUME: &str = "reports";
const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// uid/gid the workload runs as, matching the invoking user so files written
/// into the host-mounted workspace keep their ownership
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunIdentity {
    /// Numeric user id
    pub uid: u32,
    /// Numeric primary group id
    pub gid: u32,
}

impl RunIdentity {
    /// Identity of the current process's real user.
    ///
    /// The group is the user's primary group from the passwd database, or the
    /// process gid when the user has no entry (common in containers).
    pub fn current() -> Result<Self> {
        let uid = getuid();
        let gid = match User::from_uid(uid) {
            Ok(Some(user)) => user.gid,
            Ok(None) => getgid(),
            Err(e) => {
                return Err(Error::identity(format!(
                    "failed to look up user {}: {}",
                    uid, e
                )))
            }
        };
        Ok(Self {
            uid: uid.as_raw(),
            gid: gid.as_raw(),
        })
    }
}

/// Host facts the builder needs, resolved up front
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildContext {
    /// Run namespace
    pub namespace: String,
    /// Identity the workload runs as
    pub identity: RunIdentity,
    /// Directory the tool was invoked from
    pub current_dir: PathBuf,
}

impl BuildContext {
    /// Resolve identity and current directory from the running process
    pub fn from_host(namespace: impl Into<String>) -> Result<Self> {
        let identity = RunIdentity::current()?;
        let current_dir = std::env::current_dir().map_err(|e| {
            Error::internal_with_context(
                "build_context",
                format!("failed to read current directory: {}", e),
            )
        })?;
        Ok(Self {
            namespace: namespace.into(),
            identity,
            current_dir,
        })
    }
}

/// Kinds of objects a run creates
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// The run namespace
    Namespace,
    /// Identity of the test pod
    ServiceAccount,
    /// Cluster-wide rule set
    ClusterRole,
    /// Namespaced rule set
    Role,
    /// Cluster-wide grant to the service account
    ClusterRoleBinding,
    /// Namespaced grant to the service account
    RoleBinding,
    /// The test workload
    Job,
}

impl ResourceKind {
    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Namespace => "Namespace",
            Self::ServiceAccount => "ServiceAccount",
            Self::ClusterRole => "ClusterRole",
            Self::Role => "Role",
            Self::ClusterRoleBinding => "ClusterRoleBinding",
            Self::RoleBinding => "RoleBinding",
            Self::Job => "Job",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enough to find an object again for deletion
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRef {
    /// Object kind
    pub kind: ResourceKind,
    /// Object name
    pub name: String,
    /// Namespace, `None` for cluster-scoped kinds
    pub namespace: Option<String>,
}

impl ResourceRef {
    /// Reference to a cluster-scoped object
    pub fn cluster(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: None,
        }
    }

    /// Reference to a namespaced object
    pub fn namespaced(
        kind: ResourceKind,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A typed object ready to be created
#[derive(Clone, Debug, PartialEq)]
pub enum Manifest {
    /// Run namespace
    Namespace(Namespace),
    /// Test runner service account
    ServiceAccount(ServiceAccount),
    /// Rules for cluster scope
    ClusterRole(ClusterRole),
    /// Rules for namespace scope
    Role(Role),
    /// Cluster scope grant
    ClusterRoleBinding(ClusterRoleBinding),
    /// Namespace scope grant
    RoleBinding(RoleBinding),
    /// Test workload
    Job(Box<Job>),
}

impl Manifest {
    /// Kind of the wrapped object
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Namespace(_) => ResourceKind::Namespace,
            Self::ServiceAccount(_) => ResourceKind::ServiceAccount,
            Self::ClusterRole(_) => ResourceKind::ClusterRole,
            Self::Role(_) => ResourceKind::Role,
            Self::ClusterRoleBinding(_) => ResourceKind::ClusterRoleBinding,
            Self::RoleBinding(_) => ResourceKind::RoleBinding,
            Self::Job(_) => ResourceKind::Job,
        }
    }

    fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Namespace(o) => &o.metadata,
            Self::ServiceAccount(o) => &o.metadata,
            Self::ClusterRole(o) => &o.metadata,
            Self::Role(o) => &o.metadata,
            Self::ClusterRoleBinding(o) => &o.metadata,
            Self::RoleBinding(o) => &o.metadata,
            Self::Job(o) => &o.metadata,
        }
    }

    /// Object name
    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// Object namespace, `None` for cluster-scoped kinds
    pub fn namespace(&self) -> Option<&str> {
        self.metadata().namespace.as_deref()
    }

    /// Reference used to delete this object later
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef {
            kind: self.kind(),
            name: self.name().to_string(),
            namespace: self.namespace().map(str::to_string),
        }
    }

    /// Render as a YAML document
    pub fn to_yaml(&self) -> Result<String> {
        match self {
            Self::Namespace(o) => render(self.kind(), o),
            Self::ServiceAccount(o) => render(self.kind(), o),
            Self::ClusterRole(o) => render(self.kind(), o),
            Self::Role(o) => render(self.kind(), o),
            Self::ClusterRoleBinding(o) => render(self.kind(), o),
            Self::RoleBinding(o) => render(self.kind(), o),
            Self::Job(o) => render(self.kind(), o.as_ref()),
        }
    }
}

fn render<T: Serialize>(kind: ResourceKind, object: &T) -> Result<String> {
    serde_yaml::to_string(object)
        .map_err(|e| Error::serialization_for_kind(kind.as_str(), e.to_string()))
}

/// All manifests of one run, in provisioning order
#[derive(Clone, Debug, PartialEq)]
pub struct RunManifests {
    /// Run namespace
    pub namespace: Manifest,
    /// Test runner service account
    pub service_account: Manifest,
    /// ClusterRole or Role
    pub role: Manifest,
    /// ClusterRoleBinding or RoleBinding
    pub role_binding: Manifest,
    /// Test workload
    pub job: Manifest,
}

impl RunManifests {
    /// Manifests in the order they are created
    pub fn iter(&self) -> impl Iterator<Item = &Manifest> {
        [
            &self.namespace,
            &self.service_account,
            &self.role,
            &self.role_binding,
            &self.job,
        ]
        .into_iter()
    }

    /// Render as a multi-document YAML stream
    pub fn to_yaml(&self) -> Result<String> {
        let docs = self
            .iter()
            .map(Manifest::to_yaml)
            .collect::<Result<Vec<_>>>()?;
        Ok(docs.join("---\n"))
    }
}

/// Directory of the project inside the workspace.
///
/// `.` resolves to the workspace itself; anything else is joined onto it,
/// ignoring root and `.` components of the project root.
pub fn project_dir(workspace_path: &str, project_root: &str) -> String {
    if is_current_dir(project_root) {
        return workspace_path.to_string();
    }

    let mut path = PathBuf::from(workspace_path);
    for component in Path::new(project_root).components() {
        match component {
            Component::Normal(_) | Component::ParentDir => path.push(component.as_os_str()),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    path.to_string_lossy().into_owned()
}

fn object_meta(name: &str, namespace: Option<&str>, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels),
        ..Default::default()
    }
}

/// Labels for cluster-scoped objects, which also record the owning run
fn cluster_labels(name: &str, run_namespace: &str) -> BTreeMap<String, String> {
    let mut labels = managed_labels(name);
    labels.insert(LABEL_RUN_NAMESPACE.to_string(), run_namespace.to_string());
    labels
}

/// Name of the ClusterRoleBinding for a run
pub fn cluster_binding_name(namespace: &str) -> String {
    format!("{}-{}", TEST_RUNNER_NAME, namespace)
}

/// Build the run namespace
pub fn build_namespace(ctx: &BuildContext) -> Namespace {
    Namespace {
        metadata: object_meta(&ctx.namespace, None, managed_labels(&ctx.namespace)),
        ..Default::default()
    }
}

/// Build the service account the test pod runs under
pub fn build_service_account(ctx: &BuildContext) -> ServiceAccount {
    ServiceAccount {
        metadata: object_meta(
            TEST_RUNNER_NAME,
            Some(&ctx.namespace),
            managed_labels(TEST_RUNNER_NAME),
        ),
        ..Default::default()
    }
}

/// Build the ClusterRole or Role carrying the merged rules
pub fn build_role(scope: AccessScope, ctx: &BuildContext, rules: &[AccessRule]) -> Manifest {
    let rules: Vec<PolicyRule> = rules.iter().cloned().map(PolicyRule::from).collect();

    match scope {
        AccessScope::Cluster => Manifest::ClusterRole(ClusterRole {
            metadata: object_meta(
                TEST_RUNNER_NAME,
                None,
                cluster_labels(TEST_RUNNER_NAME, &ctx.namespace),
            ),
            rules: Some(rules),
            ..Default::default()
        }),
        AccessScope::Namespace => Manifest::Role(Role {
            metadata: object_meta(
                TEST_RUNNER_NAME,
                Some(&ctx.namespace),
                managed_labels(TEST_RUNNER_NAME),
            ),
            rules: Some(rules),
        }),
    }
}

/// Build the binding granting the role to the test runner service account
pub fn build_role_binding(scope: AccessScope, ctx: &BuildContext) -> Manifest {
    let subject = Subject {
        kind: "ServiceAccount".to_string(),
        name: TEST_RUNNER_NAME.to_string(),
        namespace: Some(ctx.namespace.clone()),
        ..Default::default()
    };

    match scope {
        AccessScope::Cluster => {
            let name = cluster_binding_name(&ctx.namespace);
            Manifest::ClusterRoleBinding(ClusterRoleBinding {
                metadata: object_meta(&name, None, cluster_labels(&name, &ctx.namespace)),
                role_ref: RoleRef {
                    api_group: RBAC_API_GROUP.to_string(),
                    kind: ResourceKind::ClusterRole.as_str().to_string(),
                    name: TEST_RUNNER_NAME.to_string(),
                },
                subjects: Some(vec![subject]),
            })
        }
        AccessScope::Namespace => Manifest::RoleBinding(RoleBinding {
            metadata: object_meta(
                TEST_RUNNER_NAME,
                Some(&ctx.namespace),
                managed_labels(TEST_RUNNER_NAME),
            ),
            role_ref: RoleRef {
                api_group: RBAC_API_GROUP.to_string(),
                kind: ResourceKind::Role.as_str().to_string(),
                name: TEST_RUNNER_NAME.to_string(),
            },
            subjects: Some(vec![subject]),
        }),
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// Build the test Job.
///
/// Fails with a configuration error when no project name can be derived
/// from the project root.
pub fn build_job(config: &RunConfig, ctx: &BuildContext) -> Result<Job> {
    let name = workload_name(&project_id(&config.project_root, &ctx.current_dir)?);
    let dir = project_dir(&config.workspace_path, &config.project_root);
    let uid = i64::from(ctx.identity.uid);
    let gid = i64::from(ctx.identity.gid);
    let labels = managed_labels(&name);

    Ok(Job {
        metadata: object_meta(&name, Some(&ctx.namespace), labels.clone()),
        spec: Some(JobSpec {
            backoff_limit: Some(config.backoff_limit),
            active_deadline_seconds: Some(config.active_deadline_seconds),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    service_account_name: Some(TEST_RUNNER_NAME.to_string()),
                    security_context: Some(PodSecurityContext {
                        run_as_user: Some(uid),
                        run_as_group: Some(gid),
                        fs_group: Some(gid),
                        supplemental_groups: Some(vec![gid]),
                        ..Default::default()
                    }),
                    containers: vec![Container {
                        name: CONTAINER_NAME.to_string(),
                        image: Some(config.image.clone()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        command: Some(vec![
                            "/bin/sh".to_string(),
                            "-c".to_string(),
                            config.test_command.clone(),
                        ]),
                        working_dir: Some(dir.clone()),
                        env: Some(vec![
                            env_var(ENV_TEST_NAMESPACE, &ctx.namespace),
                            env_var(ENV_PROJECT_ROOT, &config.project_root),
                            env_var(ENV_WORKSPACE_PATH, &config.workspace_path),
                        ]),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: SOURCE_VOLUME.to_string(),
                                mount_path: SOURCE_MOUNT_PATH.to_string(),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: REPORTS_VOLUME.to_string(),
                                mount_path: REPORTS_MOUNT_PATH.to_string(),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        Volume {
                            name: SOURCE_VOLUME.to_string(),
                            host_path: Some(HostPathVolumeSource {
                                path: dir,
                                type_: Some("Directory".to_string()),
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: REPORTS_VOLUME.to_string(),
                            empty_dir: Some(EmptyDirVolumeSource::default()),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Build every manifest of a run
pub fn build_run_manifests(
    config: &RunConfig,
    ctx: &BuildContext,
    rules: &[AccessRule],
) -> Result<RunManifests> {
    Ok(RunManifests {
        namespace: Manifest::Namespace(build_namespace(ctx)),
        service_account: Manifest::ServiceAccount(build_service_account(ctx)),
        role: build_role(config.access_scope, ctx, rules),
        role_binding: build_role_binding(config.access_scope, ctx),
        job: Manifest::Job(Box::new(build_job(config, ctx)?)),
    })
}
