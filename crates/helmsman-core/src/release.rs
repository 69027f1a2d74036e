//! Desired release definitions

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::hooks::Hooks;
use crate::merge_fields;

/// Identity of a release in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReleaseKey {
    pub name: String,
    pub namespace: String,
}

impl ReleaseKey {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for ReleaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.namespace)
    }
}

/// A release as declared under `apps` (or `appsTemplates`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Release {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Name of an `appsTemplates` entry providing defaults
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chart: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub values_file: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values_files: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secrets_file: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets_files: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub post_renderer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Hooks::is_default")]
    pub hooks: Hooks,
    /// Seconds, passed as `--timeout <n>s`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_hooks: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_history: Option<u32>,
    #[serde(default, deserialize_with = "scalar_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "scalar_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub set_string: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set_file: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub helm_flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub helm_diff_flags: Vec<String>,

    /// Excluded by target/group selection for this run
    #[serde(skip)]
    pub ignored: bool,
}

merge_fields!(Release {
    name,
    description,
    namespace,
    enabled,
    template,
    group,
    chart,
    version,
    values_file,
    values_files,
    secrets_file,
    secrets_files,
    post_renderer,
    test,
    protected,
    wait,
    priority,
    hooks,
    timeout,
    no_hooks,
    max_history,
    set,
    set_string,
    set_file,
    helm_flags,
    helm_diff_flags,
});

impl Release {
    pub fn key(&self) -> ReleaseKey {
        ReleaseKey::new(&self.name, &self.namespace)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    pub fn is_protected(&self) -> bool {
        self.protected.unwrap_or(false)
    }

    pub fn priority(&self) -> i32 {
        self.priority.unwrap_or(0)
    }

    /// `valuesFile` followed by `valuesFiles`
    pub fn all_values_files(&self) -> Vec<&str> {
        std::iter::once(self.values_file.as_str())
            .filter(|f| !f.is_empty())
            .chain(self.values_files.iter().map(String::as_str))
            .collect()
    }

    /// `secretsFile` followed by `secretsFiles`
    pub fn all_secrets_files(&self) -> Vec<&str> {
        std::iter::once(self.secrets_file.as_str())
            .filter(|f| !f.is_empty())
            .chain(self.secrets_files.iter().map(String::as_str))
            .collect()
    }

    pub fn is_oci_chart(&self) -> bool {
        self.chart.starts_with("oci://")
    }

    /// Local charts carry an absolute path once the DSF has been expanded
    pub fn is_local_chart(&self) -> bool {
        !self.is_oci_chart() && Path::new(&self.chart).is_absolute()
    }

    /// Repository part of a `repo/name` chart reference
    pub fn chart_repo(&self) -> Option<&str> {
        if self.is_local_chart() || self.is_oci_chart() {
            return None;
        }
        self.chart.split_once('/').map(|(repo, _)| repo)
    }

    /// Chart name as inferred from the chart reference
    pub fn chart_name(&self) -> &str {
        self.chart
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.chart)
    }
}

fn scalar_map<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        String(String),
        Int(i64),
        Float(f64),
        Bool(bool),
    }

    // Floats lose their source text (`1.10` parses as 1.1), so they must be quoted
    let raw = BTreeMap::<String, Scalar>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(k, v)| {
            let v = match v {
                Scalar::String(s) => s,
                Scalar::Int(i) => i.to_string(),
                Scalar::Bool(b) => b.to_string(),
                Scalar::Float(f) => {
                    return Err(D::Error::custom(format!(
                        "value of '{}' parses as the number {}; quote it to keep its exact text",
                        k, f
                    )));
                }
            };
            Ok((k, v))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::Merge;

    #[test]
    fn test_key_display() {
        let key = ReleaseKey::new("jenkins", "staging");
        assert_eq!(key.to_string(), "jenkins-staging");
    }

    #[test]
    fn test_chart_reference_parts() {
        let remote = Release {
            chart: "stable/jenkins".to_string(),
            ..Default::default()
        };
        assert_eq!(remote.chart_repo(), Some("stable"));
        assert_eq!(remote.chart_name(), "jenkins");
        assert!(!remote.is_local_chart());

        let local = Release {
            chart: "/charts/my-app".to_string(),
            ..Default::default()
        };
        assert!(local.is_local_chart());
        assert_eq!(local.chart_repo(), None);
        assert_eq!(local.chart_name(), "my-app");

        let oci = Release {
            chart: "oci://registry.example.com/charts/nginx".to_string(),
            ..Default::default()
        };
        assert!(oci.is_oci_chart());
        assert_eq!(oci.chart_name(), "nginx");
    }

    #[test]
    fn test_set_accepts_scalars() {
        let yaml = r#"
set:
  replicas: 3
  debug: true
  image.tag: "1.2"
"#;
        let release: Release = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(release.set["replicas"], "3");
        assert_eq!(release.set["debug"], "true");
        assert_eq!(release.set["image.tag"], "1.2");
    }

    #[test]
    fn test_set_rejects_unquoted_floats() {
        let yaml = "set:\n  image.tag: 1.10\n";
        let err = serde_yaml::from_str::<Release>(yaml).unwrap_err();
        assert!(err.to_string().contains("quote it"), "{err}");

        let quoted: Release = serde_yaml::from_str("setString:\n  image.tag: \"1.10\"\n  ratio: \"1e3\"\n").unwrap();
        assert_eq!(quoted.set_string["image.tag"], "1.10");
        assert_eq!(quoted.set_string["ratio"], "1e3");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = "chart: stable/jenkins\nversoin: 1.0.0\n";
        assert!(serde_yaml::from_str::<Release>(yaml).is_err());
    }

    #[test]
    fn test_merge_preserves_enabled() {
        let mut base = Release {
            enabled: Some(true),
            version: "1.0.0".to_string(),
            ..Default::default()
        };
        base.merge(Release {
            version: "1.1.0".to_string(),
            ..Default::default()
        });

        assert_eq!(base.enabled, Some(true));
        assert_eq!(base.version, "1.1.0");
    }

    #[test]
    fn test_values_files_order() {
        let release = Release {
            values_file: "a.yaml".to_string(),
            values_files: vec!["b.yaml".to_string()],
            ..Default::default()
        };
        assert_eq!(release.all_values_files(), vec!["a.yaml", "b.yaml"]);
    }
}
