//! Idempotent create and delete of run resources
//!
//! Creating an object that already exists and deleting one that is already
//! gone both count as success, so provisioning can be repeated and cleanup
//! can run against partially provisioned state.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use ket_common::kube_utils::{absorb_already_exists, absorb_not_found, Idempotent};
use ket_common::{Error, Result};

use crate::manifest::{Manifest, ResourceKind, ResourceRef};

/// Creates and deletes run resources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceApplier: Send + Sync {
    /// Create the object; an existing object with the same name is success
    async fn create(&self, manifest: &Manifest) -> Result<()>;

    /// Delete the object; a missing object is success
    async fn delete(&self, resource: &ResourceRef) -> Result<()>;
}

/// [`ResourceApplier`] backed by the cluster API
pub struct KubeApplier {
    client: Client,
}

impl KubeApplier {
    /// Create an applier using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, kind: ResourceKind, name: &str, namespace: Option<&str>) -> Result<Api<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        let namespace = namespace.ok_or_else(|| {
            Error::internal_with_context(
                "apply",
                format!("{} {} has no namespace", kind, name),
            )
        })?;
        Ok(Api::namespaced(self.client.clone(), namespace))
    }

    async fn create_namespace(&self, ns: &Namespace) -> Result<Idempotent> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        create_object(&api, ResourceKind::Namespace, ns).await
    }

    async fn create_service_account(&self, sa: &ServiceAccount) -> Result<Idempotent> {
        let api: Api<ServiceAccount> = self.namespaced(
            ResourceKind::ServiceAccount,
            sa.metadata.name.as_deref().unwrap_or_default(),
            sa.metadata.namespace.as_deref(),
        )?;
        create_object(&api, ResourceKind::ServiceAccount, sa).await
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<Idempotent> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        create_object(&api, ResourceKind::ClusterRole, role).await
    }

    async fn create_role(&self, role: &Role) -> Result<Idempotent> {
        let api: Api<Role> = self.namespaced(
            ResourceKind::Role,
            role.metadata.name.as_deref().unwrap_or_default(),
            role.metadata.namespace.as_deref(),
        )?;
        create_object(&api, ResourceKind::Role, role).await
    }

    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<Idempotent> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        create_object(&api, ResourceKind::ClusterRoleBinding, binding).await
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<Idempotent> {
        let api: Api<RoleBinding> = self.namespaced(
            ResourceKind::RoleBinding,
            binding.metadata.name.as_deref().unwrap_or_default(),
            binding.metadata.namespace.as_deref(),
        )?;
        create_object(&api, ResourceKind::RoleBinding, binding).await
    }

    async fn create_job(&self, job: &Job) -> Result<Idempotent> {
        let api: Api<Job> = self.namespaced(
            ResourceKind::Job,
            job.metadata.name.as_deref().unwrap_or_default(),
            job.metadata.namespace.as_deref(),
        )?;
        create_object(&api, ResourceKind::Job, job).await
    }
}

async fn create_object<K>(api: &Api<K>, kind: ResourceKind, object: &K) -> Result<Idempotent>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    let name = object.meta().name.clone().unwrap_or_default();
    absorb_already_exists(api.create(&PostParams::default(), object).await)
        .map_err(|e| Error::resource_create(kind.as_str(), name, e))
}

async fn delete_object<K>(api: &Api<K>, resource: &ResourceRef, params: &DeleteParams) -> Result<Idempotent>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    absorb_not_found(api.delete(&resource.name, params).await)
        .map_err(|e| Error::resource_delete(resource.kind.as_str(), resource.name.clone(), e))
}

#[async_trait]
impl ResourceApplier for KubeApplier {
    async fn create(&self, manifest: &Manifest) -> Result<()> {
        let outcome = match manifest {
            Manifest::Namespace(ns) => self.create_namespace(ns).await?,
            Manifest::ServiceAccount(sa) => self.create_service_account(sa).await?,
            Manifest::ClusterRole(role) => self.create_cluster_role(role).await?,
            Manifest::Role(role) => self.create_role(role).await?,
            Manifest::ClusterRoleBinding(binding) => {
                self.create_cluster_role_binding(binding).await?
            }
            Manifest::RoleBinding(binding) => self.create_role_binding(binding).await?,
            Manifest::Job(job) => self.create_job(job).await?,
        };

        if outcome == Idempotent::Unchanged {
            debug!(
                kind = %manifest.kind(),
                name = %manifest.name(),
                "resource already exists"
            );
        }
        Ok(())
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<()> {
        let params = DeleteParams::default();
        let ns = resource.namespace.as_deref();
        let outcome = match resource.kind {
            ResourceKind::Namespace => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                delete_object(&api, resource, &params).await?
            }
            ResourceKind::ClusterRole => {
                let api: Api<ClusterRole> = Api::all(self.client.clone());
                delete_object(&api, resource, &params).await?
            }
            ResourceKind::ClusterRoleBinding => {
                let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
                delete_object(&api, resource, &params).await?
            }
            ResourceKind::ServiceAccount => {
                let api: Api<ServiceAccount> =
                    self.namespaced(resource.kind, &resource.name, ns)?;
                delete_object(&api, resource, &params).await?
            }
            ResourceKind::Role => {
                let api: Api<Role> = self.namespaced(resource.kind, &resource.name, ns)?;
                delete_object(&api, resource, &params).await?
            }
            ResourceKind::RoleBinding => {
                let api: Api<RoleBinding> = self.namespaced(resource.kind, &resource.name, ns)?;
                delete_object(&api, resource, &params).await?
            }
            ResourceKind::Job => {
                // pods go with the job
                let api: Api<Job> = self.namespaced(resource.kind, &resource.name, ns)?;
                delete_object(&api, resource, &DeleteParams::background()).await?
            }
        };

        if outcome == Idempotent::Unchanged {
            debug!(resource = %resource, "resource already gone");
        }
        Ok(())
    }
}
