//! Kubernetes-safe names for run namespaces and workloads

use std::path::{Component, Path};

use ket_common::{Error, Result, RESOURCE_PREFIX};

/// Maximum length of a DNS-1123 label
pub const MAX_LABEL_LEN: usize = 63;

/// Length of the random suffix appended to generated namespace names
pub const SUFFIX_LEN: usize = 8;

/// Replace every run of characters outside `[A-Za-z0-9]` with a single `-`
/// and trim hyphens from both ends.
///
/// Case is preserved; callers that need a DNS label lowercase the result.
pub fn to_kube_safe(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_hyphen = false;

    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c);
        } else {
            pending_hyphen = true;
        }
    }
    out
}

/// Whether `name` is a valid DNS-1123 label
pub fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_LABEL_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

/// Whether `name` can identify a run namespace: a DNS-1123 label without
/// doubled hyphens, the same shape [`to_kube_safe`] produces
pub fn is_namespace_name(name: &str) -> bool {
    is_dns_label(name) && !name.contains("--")
}

/// Build `<prefix>-<suffix>` where the prefix is sanitized, lowercased and
/// cut short enough for the whole name to fit in a DNS label.
pub fn namespace_with_suffix(prefix: &str, suffix: &str) -> String {
    let budget = MAX_LABEL_LEN - SUFFIX_LEN - 1;
    let safe = to_kube_safe(prefix).to_lowercase();
    let cut: String = safe.chars().take(budget).collect();
    let cut = cut.trim_end_matches('-');
    let suffix: String = suffix
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(SUFFIX_LEN)
        .collect::<String>()
        .to_lowercase();
    format!("{}-{}", cut, suffix)
}

/// Generate a fresh namespace name from the configured prefix
pub fn generate_namespace(prefix: &str) -> String {
    namespace_with_suffix(prefix, &uuid::Uuid::new_v4().simple().to_string())
}

/// Whether a project root refers to the workspace itself (`.`, `./`, empty)
pub fn is_current_dir(project_root: &str) -> bool {
    Path::new(project_root)
        .components()
        .all(|c| matches!(c, Component::CurDir))
}

/// Identifier of the project under test, derived from the last path
/// component of the project root (or of `current_dir` for `.`)
pub fn project_id(project_root: &str, current_dir: &Path) -> Result<String> {
    let source = if is_current_dir(project_root) {
        current_dir
    } else {
        Path::new(project_root)
    };

    let last = source
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .last()
        .unwrap_or_default();

    let id = to_kube_safe(&last).to_lowercase();
    // leave room for the "ket-" prefix
    let id: String = id
        .chars()
        .take(MAX_LABEL_LEN - RESOURCE_PREFIX.len() - 1)
        .collect();
    let id = id.trim_end_matches('-').to_string();

    if id.is_empty() {
        return Err(Error::config_for_field(
            "projectRoot",
            format!(
                "cannot derive a project name from '{}' (resolved to {})",
                project_root,
                source.display()
            ),
        ));
    }
    Ok(id)
}

/// Name of the test Job for a project id
pub fn workload_name(project_id: &str) -> String {
    format!("{}-{}", RESOURCE_PREFIX, project_id)
}
