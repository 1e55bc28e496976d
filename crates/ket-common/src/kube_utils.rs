//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction plus the small amount of API-error classification the
//! applier needs to make create/delete idempotent.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default read timeout for kube clients.
///
/// Log streams are long-lived reads, so this has to stay generous; idle
/// containers that print nothing for longer than this reconnect.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(295);

/// HTTP status returned when a resource already exists
const STATUS_CONFLICT: u16 = 409;
/// HTTP status returned when a resource does not exist
const STATUS_NOT_FOUND: u16 = 404;

/// Create a kube client from an optional kubeconfig path and context
pub async fn create_client(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Client, Error> {
    create_client_with_timeout(
        kubeconfig,
        context,
        DEFAULT_CONNECT_TIMEOUT,
        DEFAULT_READ_TIMEOUT,
    )
    .await
}

/// Create a kube client from an optional kubeconfig path and context with custom timeouts
///
/// Without an explicit path the usual inference chain applies: `KUBECONFIG`,
/// `~/.kube/config`, then the in-cluster service account.
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    context: Option<&str>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..KubeConfigOptions::default()
    };

    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None if context.is_some() => Config::from_kubeconfig(&options).await.map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to load kubeconfig context: {}", e),
            )
        })?,
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };

    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Whether the API server rejected a create because the object already exists
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == STATUS_CONFLICT)
}

/// Whether the API server reported that the object does not exist
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == STATUS_NOT_FOUND)
}

/// Outcome of an idempotent create or delete call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Idempotent {
    /// The call changed cluster state
    Applied,
    /// The cluster was already in the requested state
    Unchanged,
}

/// Treat "already exists" as success for a create call.
pub fn absorb_already_exists<T>(result: Result<T, kube::Error>) -> Result<Idempotent, kube::Error> {
    match result {
        Ok(_) => Ok(Idempotent::Applied),
        Err(e) if is_already_exists(&e) => Ok(Idempotent::Unchanged),
        Err(e) => Err(e),
    }
}

/// Treat "not found" as success for a delete call.
pub fn absorb_not_found<T>(result: Result<T, kube::Error>) -> Result<Idempotent, kube::Error> {
    match result {
        Ok(_) => Ok(Idempotent::Applied),
        Err(e) if is_not_found(&e) => Ok(Idempotent::Unchanged),
        Err(e) => Err(e),
    }
}

/// Standard labels placed on every resource ket creates
pub fn managed_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            crate::LABEL_MANAGED_BY.to_string(),
            crate::LABEL_MANAGED_BY_KET.to_string(),
        ),
        ("app.kubernetes.io/name".to_string(), name.to_string()),
    ])
}
