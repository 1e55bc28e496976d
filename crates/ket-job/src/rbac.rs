//! Access rules granted to the test workload
//!
//! A run always grants [`default_rules`]. Callers can add more through a YAML
//! rule file:
//!
//! ```yaml
//! rules:
//!   - apiGroups: ["monitoring.coreos.com"]
//!     resources: ["servicemonitors"]
//!     verbs: ["get", "list", "create"]
//! ```
//!
//! Supplemental rules are appended after the defaults as-is.

use std::path::Path;

use k8s_openapi::api::rbac::v1::PolicyRule;
use serde::{Deserialize, Serialize};
use tracing::debug;

use ket_common::{Error, Result};

const CRUD_WATCH: &[&str] = &[
    "get", "list", "watch", "create", "update", "patch", "delete",
];

/// One access grant: verbs allowed on resources of some API groups
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessRule {
    /// API groups (`""` is the core group)
    #[serde(default)]
    pub api_groups: Vec<String>,
    /// Resource types, including subresources like `pods/log`
    #[serde(default)]
    pub resources: Vec<String>,
    /// Allowed verbs
    #[serde(default)]
    pub verbs: Vec<String>,
    /// Restrict the grant to specific object names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_names: Option<Vec<String>>,
}

impl AccessRule {
    /// Build a rule from string slices
    pub fn new(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> Self {
        Self {
            api_groups: to_strings(api_groups),
            resources: to_strings(resources),
            verbs: to_strings(verbs),
            resource_names: None,
        }
    }
}

impl From<AccessRule> for PolicyRule {
    fn from(rule: AccessRule) -> Self {
        PolicyRule {
            api_groups: Some(rule.api_groups),
            resources: Some(rule.resources),
            verbs: rule.verbs,
            resource_names: rule.resource_names,
            non_resource_urls: None,
        }
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Default, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<AccessRule>,
}

/// Grants every run gets: enough to deploy and inspect ordinary workloads
pub fn default_rules() -> Vec<AccessRule> {
    vec![
        AccessRule::new(
            &[""],
            &[
                "pods",
                "services",
                "configmaps",
                "secrets",
                "persistentvolumeclaims",
                "endpoints",
            ],
            CRUD_WATCH,
        ),
        AccessRule::new(
            &[""],
            &["pods/log", "pods/portforward", "pods/exec"],
            &["get", "list", "create"],
        ),
        AccessRule::new(&[""], &["events"], &["get", "list", "watch"]),
        AccessRule::new(
            &["apps"],
            &["deployments", "statefulsets", "daemonsets"],
            CRUD_WATCH,
        ),
        AccessRule::new(&["batch"], &["jobs", "cronjobs"], CRUD_WATCH),
        AccessRule::new(
            &["networking.k8s.io"],
            &["ingresses", "networkpolicies"],
            CRUD_WATCH,
        ),
        AccessRule::new(&[""], &["namespaces"], &["get", "delete"]),
    ]
}

/// Load extra rules from a YAML rule file.
///
/// No path (or an empty one) means no extra rules.
pub fn load_supplemental_rules(path: Option<&Path>) -> Result<Vec<AccessRule>> {
    let Some(path) = path.filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(Vec::new());
    };

    let contents = std::fs::read_to_string(path).map_err(|source| Error::RuleRead {
        path: path.to_path_buf(),
        source,
    })?;

    // an empty document deserializes as unit, not as a map
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }

    let file: RuleFile = serde_yaml::from_str(&contents).map_err(|source| Error::RuleParse {
        path: path.to_path_buf(),
        source,
    })?;

    debug!(path = %path.display(), count = file.rules.len(), "loaded supplemental rules");
    Ok(file.rules)
}

/// Defaults followed by supplemental rules, in order, without deduplication
pub fn merge_rules(defaults: Vec<AccessRule>, supplemental: Vec<AccessRule>) -> Vec<AccessRule> {
    let mut rules = defaults;
    rules.extend(supplemental);
    rules
}

/// Default rules merged with those from an optional rule file
pub fn resolve_rules(rule_file: Option<&Path>) -> Result<Vec<AccessRule>> {
    Ok(merge_rules(default_rules(), load_supplemental_rules(rule_file)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn rule_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_cover_core_workloads() {
        let rules = default_rules();
        assert_eq!(rules.len(), 7);

        let pods = &rules[0];
        assert_eq!(pods.api_groups, vec![""]);
        assert!(pods.resources.contains(&"secrets".to_string()));
        assert!(pods.verbs.contains(&"watch".to_string()));

        let namespaces = rules.last().unwrap();
        assert_eq!(namespaces.resources, vec!["namespaces"]);
        assert_eq!(namespaces.verbs, vec!["get", "delete"]);
    }

    #[test]
    fn no_path_means_no_rules() {
        assert!(load_supplemental_rules(None).unwrap().is_empty());
        assert!(load_supplemental_rules(Some(Path::new(""))).unwrap().is_empty());
    }

    #[test]
    fn loads_rules_from_yaml() {
        let file = rule_file(
            r#"
rules:
  - apiGroups: ["monitoring.coreos.com"]
    resources: ["servicemonitors"]
    verbs: ["get", "create"]
  - apiGroups: [""]
    resources: ["configmaps"]
    verbs: ["get"]
    resourceNames: ["app-settings"]
"#,
        );
        let rules = load_supplemental_rules(Some(file.path())).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].api_groups, vec!["monitoring.coreos.com"]);
        assert_eq!(
            rules[1].resource_names.as_deref(),
            Some(&["app-settings".to_string()][..])
        );
    }

    #[test]
    fn document_without_rules_is_empty() {
        let file = rule_file("other: value\n");
        assert!(load_supplemental_rules(Some(file.path())).unwrap().is_empty());

        let file = rule_file("");
        assert!(load_supplemental_rules(Some(file.path())).unwrap().is_empty());
    }

    #[test]
    fn missing_file_is_read_error() {
        let path = PathBuf::from("/nonexistent/ket/rules.yaml");
        match load_supplemental_rules(Some(&path)).unwrap_err() {
            Error::RuleRead { path: p, .. } => assert_eq!(p, path),
            other => panic!("Expected RuleRead, got {other:?}"),
        }
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let file = rule_file("rules: [ {apiGroups: ");
        assert!(matches!(
            load_supplemental_rules(Some(file.path())).unwrap_err(),
            Error::RuleParse { .. }
        ));

        let file = rule_file("rules: \"not a list\"\n");
        assert!(matches!(
            load_supplemental_rules(Some(file.path())).unwrap_err(),
            Error::RuleParse { .. }
        ));
    }

    #[test]
    fn merge_is_plain_concatenation() {
        let extra = vec![
            AccessRule::new(&[""], &["pods"], &["get"]),
            AccessRule::new(&[""], &["pods"], &["get"]),
        ];
        let merged = merge_rules(default_rules(), extra.clone());

        assert_eq!(merged.len(), default_rules().len() + 2);
        assert_eq!(&merged[..default_rules().len()], &default_rules()[..]);
        assert_eq!(&merged[default_rules().len()..], &extra[..]);
    }

    #[test]
    fn converts_into_policy_rule() {
        let rule: PolicyRule = AccessRule::new(&["apps"], &["deployments"], &["get"]).into();
        assert_eq!(rule.api_groups, Some(vec!["apps".to_string()]));
        assert_eq!(rule.resources, Some(vec!["deployments".to_string()]));
        assert_eq!(rule.verbs, vec!["get".to_string()]);
        assert!(rule.resource_names.is_none());
    }
}
