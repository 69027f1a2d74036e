//! Current cluster state as observed through `helm list` and storage labels

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, FixedOffset};
use futures::stream::{self, StreamExt};
use helmsman_core::state::DEFAULT_CONTEXT;
use helmsman_core::{ChartInfo, ReleaseKey, StorageBackend, parse_chart_label};
use serde::{Deserialize, Deserializer};
use tracing::{debug, info, warn};

use crate::command::{Command, CommandRunner};
use crate::error::{KubeError, Result};

/// Concurrent context lookups during observation
pub const OBSERVER_POOL_SIZE: usize = 10;

/// Labels stamped on Helm storage objects owned by this tool
pub const MANAGED_BY_LABEL: &str = "MANAGED-BY";
pub const MANAGED_BY_VALUE: &str = "HELMSMAN";
pub const CONTEXT_LABEL: &str = "HELMSMAN_CONTEXT";
pub const NAMESPACE_LABEL: &str = "NAMESPACE";

/// Helm release status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseStatus {
    Deployed,
    Failed,
    /// Uninstalled with history kept (`deleted` in Helm 2 terms)
    Uninstalled,
    Superseded,
    Uninstalling,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    Unknown(String),
}

impl ReleaseStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "deployed" => Self::Deployed,
            "failed" => Self::Failed,
            "uninstalled" | "deleted" => Self::Uninstalled,
            "superseded" => Self::Superseded,
            "uninstalling" => Self::Uninstalling,
            "pending-install" => Self::PendingInstall,
            "pending-upgrade" => Self::PendingUpgrade,
            "pending-rollback" => Self::PendingRollback,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// An operation is in flight on the release
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::PendingInstall | Self::PendingUpgrade | Self::PendingRollback | Self::Uninstalling
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Deployed => "deployed",
            Self::Failed => "failed",
            Self::Uninstalled => "uninstalled",
            Self::Superseded => "superseded",
            Self::Uninstalling => "uninstalling",
            Self::PendingInstall => "pending-install",
            Self::PendingUpgrade => "pending-upgrade",
            Self::PendingRollback => "pending-rollback",
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ReleaseStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// One entry of `helm list --output json`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HelmRelease {
    pub name: String,
    pub namespace: String,
    #[serde(deserialize_with = "revision")]
    pub revision: u32,
    #[serde(default)]
    pub updated: String,
    pub status: ReleaseStatus,
    pub chart: String,
    #[serde(default)]
    pub app_version: String,
    /// Managing context read from the storage object; empty when the lookup failed
    #[serde(skip)]
    pub context: String,
}

impl HelmRelease {
    pub fn key(&self) -> ReleaseKey {
        ReleaseKey::new(&self.name, &self.namespace)
    }

    /// Chart name and version parsed from the `chart` label
    pub fn chart_info(&self) -> ChartInfo {
        let (name, version) = parse_chart_label(&self.chart);
        ChartInfo { name, version }
    }

    /// `updated` parsed from Helm's `2024-01-15 10:30:00.123 +0000 UTC` format
    pub fn updated_at(&self) -> Option<DateTime<FixedOffset>> {
        let mut parts = self.updated.split_whitespace();
        let stamp = format!("{} {} {}", parts.next()?, parts.next()?, parts.next()?);
        DateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S%.f %z").ok()
    }
}

fn revision<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u32),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(n) => Ok(n),
        Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Observed releases keyed by (name, namespace)
#[derive(Debug, Clone, Default)]
pub struct CurrentState {
    releases: BTreeMap<ReleaseKey, HelmRelease>,
    context: String,
}

impl CurrentState {
    /// `context` is the managing context of this run
    pub fn new(context: impl Into<String>, releases: impl IntoIterator<Item = HelmRelease>) -> Self {
        Self {
            releases: releases.into_iter().map(|r| (r.key(), r)).collect(),
            context: context.into(),
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn len(&self) -> usize {
        self.releases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.releases.is_empty()
    }

    /// Any observation at the key, whatever its context
    pub fn raw(&self, key: &ReleaseKey) -> Option<&HelmRelease> {
        self.releases.get(key)
    }

    /// The observation at `key` if it belongs to the current context
    pub fn find(&self, key: &ReleaseKey) -> Option<&HelmRelease> {
        self.raw(key).filter(|r| r.context == self.context)
    }

    /// The observation at `key` when it is owned by another context
    pub fn foreign(&self, key: &ReleaseKey) -> Option<&HelmRelease> {
        self.raw(key).filter(|r| r.context != self.context)
    }

    /// Releases visible to this context
    pub fn managed(&self) -> impl Iterator<Item = &HelmRelease> {
        self.releases.values().filter(|r| r.context == self.context)
    }

    /// Releases named `name` in this context, outside `namespace`
    pub fn same_name_elsewhere<'a>(
        &'a self,
        name: &'a str,
        namespace: &'a str,
    ) -> impl Iterator<Item = &'a HelmRelease> + 'a {
        self.managed()
            .filter(move |r| r.name == name && r.namespace != namespace)
    }
}

/// Builds [`CurrentState`] by querying helm and kubectl
pub struct Observer<'a> {
    runner: &'a dyn CommandRunner,
    backend: StorageBackend,
    context: String,
}

#[derive(Deserialize)]
struct StorageList {
    #[serde(default)]
    items: Vec<StorageObject>,
}

#[derive(Deserialize)]
struct StorageObject {
    metadata: StorageMetadata,
}

#[derive(Deserialize)]
struct StorageMetadata {
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct StatusOutput {
    info: StatusInfo,
}

#[derive(Deserialize)]
struct StatusInfo {
    status: ReleaseStatus,
}

impl<'a> Observer<'a> {
    pub fn new(runner: &'a dyn CommandRunner, backend: StorageBackend, context: impl Into<String>) -> Self {
        Self {
            runner,
            backend,
            context: context.into(),
        }
    }

    /// List every release in the cluster and read its managing context
    pub async fn build_state(&self) -> Result<CurrentState> {
        let cmd = Command::helm()
            .args(["list", "--all", "--max", "0", "--output", "json", "--all-namespaces"])
            .describe("Listing all existing releases");
        let out = self.runner.run(&cmd).await;
        if !out.success() {
            return Err(KubeError::Observation(format!(
                "{} failed: {}",
                cmd,
                out.stderr.trim()
            )));
        }

        let releases = parse_release_list(&out.stdout)?;
        debug!("Found {} releases in the cluster", releases.len());

        let releases: Vec<HelmRelease> = stream::iter(releases)
            .map(|mut release| async move {
                release.context = self.lookup_context(&release).await;
                release
            })
            .buffer_unordered(OBSERVER_POOL_SIZE)
            .collect()
            .await;

        let state = CurrentState::new(&self.context, releases);
        info!(
            "{} of {} releases are managed by context [ {} ]",
            state.managed().count(),
            state.len(),
            self.context
        );
        Ok(state)
    }

    async fn lookup_context(&self, release: &HelmRelease) -> String {
        let cmd = Command::kubectl()
            .args(["get", self.backend.kind(), "-n", &release.namespace, "-l"])
            .arg(format!("owner=helm,name={}", release.name))
            .args(["-o", &format!("jsonpath={{.items[-1].metadata.labels.{}}}", CONTEXT_LABEL)])
            .describe(format!("Getting context of release [ {} ]", release.key()));
        let out = self.runner.run(&cmd).await;
        if !out.success() {
            warn!(
                "Could not read the managing context of release [ {} ]: {}",
                release.key(),
                out.stderr.trim()
            );
            return String::new();
        }
        let label = out.stdout.trim().trim_matches('\'');
        if label.is_empty() {
            DEFAULT_CONTEXT.to_string()
        } else {
            label.to_string()
        }
    }

    /// Keys of all storage objects labelled as managed by this context
    pub async fn managed_release_keys(&self) -> Result<BTreeSet<ReleaseKey>> {
        let cmd = Command::kubectl()
            .args(["get", self.backend.kind(), "--all-namespaces", "-l"])
            .arg(format!(
                "{}={},{}={}",
                MANAGED_BY_LABEL, MANAGED_BY_VALUE, CONTEXT_LABEL, self.context
            ))
            .args(["-o", "json"])
            .describe("Listing releases managed by this context");
        let out = self.runner.run(&cmd).await;
        if !out.success() {
            return Err(KubeError::Observation(format!(
                "{} failed: {}",
                cmd,
                out.stderr.trim()
            )));
        }
        if out.stdout.trim().is_empty() {
            return Ok(BTreeSet::new());
        }
        let list: StorageList = serde_json::from_str(&out.stdout)?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|item| {
                let name = item.metadata.labels.get("name")?.clone();
                let namespace = if item.metadata.namespace.is_empty() {
                    item.metadata.labels.get(NAMESPACE_LABEL)?.clone()
                } else {
                    item.metadata.namespace
                };
                Some(ReleaseKey::new(name, namespace))
            })
            .collect())
    }

    /// Current status of a single release
    pub async fn status(&self, key: &ReleaseKey) -> Result<ReleaseStatus> {
        let cmd = Command::helm()
            .args(["status", &key.name, "--namespace", &key.namespace, "--output", "json"])
            .describe(format!("Checking status of release [ {} ]", key));
        let out = self.runner.run_checked(&cmd).await?;
        let status: StatusOutput = serde_json::from_str(&out.stdout)?;
        Ok(status.info.status)
    }
}

/// Parse `helm list --output json`; empty output means no releases
pub fn parse_release_list(raw: &str) -> Result<Vec<HelmRelease>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw).map_err(|e| KubeError::Observation(format!("invalid helm list output: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, MockRunner};

    const LIST: &str = r#"[
      {"name":"jenkins","namespace":"staging","revision":"3","updated":"2024-01-15 10:30:00.123456 +0000 UTC","status":"deployed","chart":"jenkins-0.9.0","app_version":"2.0"},
      {"name":"certs","namespace":"kube-system","revision":1,"updated":"","status":"pending-upgrade","chart":"cert-manager-v0.5.2","app_version":""},
      {"name":"legacy","namespace":"staging","revision":"2","updated":"","status":"deleted","chart":"legacy-1.0.0","app_version":""}
    ]"#;

    #[test]
    fn test_parse_release_list() {
        let releases = parse_release_list(LIST).unwrap();
        assert_eq!(releases.len(), 3);
        assert_eq!(releases[0].revision, 3);
        assert_eq!(releases[1].revision, 1);
        assert!(releases[1].status.is_pending());
        assert_eq!(releases[2].status, ReleaseStatus::Uninstalled);
        assert_eq!(
            releases[1].chart_info(),
            ChartInfo {
                name: "cert-manager".to_string(),
                version: "v0.5.2".to_string()
            }
        );
        let updated = releases[0].updated_at().unwrap();
        assert_eq!(updated.timestamp(), 1_705_314_600);
        assert!(parse_release_list("  ").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_build_state_reads_contexts() {
        let mock = MockRunner::new();
        mock.on("helm list", CommandOutput::ok(LIST));
        mock.on("kubectl get secret -n staging -l owner=helm,name=jenkins", CommandOutput::ok("alpha"));
        mock.on("kubectl get secret -n kube-system", CommandOutput::ok(""));
        mock.on("kubectl get secret -n staging -l owner=helm,name=legacy", CommandOutput::failed(1, "forbidden"));

        let observer = Observer::new(&mock, StorageBackend::Secret, "alpha");
        let state = observer.build_state().await.unwrap();

        let jenkins = ReleaseKey::new("jenkins", "staging");
        let certs = ReleaseKey::new("certs", "kube-system");
        let legacy = ReleaseKey::new("legacy", "staging");
        assert_eq!(state.find(&jenkins).unwrap().context, "alpha");
        assert_eq!(state.raw(&certs).unwrap().context, DEFAULT_CONTEXT);
        assert!(state.find(&certs).is_none());
        assert!(state.foreign(&certs).is_some());
        assert_eq!(state.raw(&legacy).unwrap().context, "");
        assert_eq!(state.managed().count(), 1);
    }

    #[tokio::test]
    async fn test_helm_list_failure_is_fatal() {
        let mock = MockRunner::new();
        mock.on("helm list", CommandOutput::failed(1, "Kubernetes cluster unreachable"));
        let err = Observer::new(&mock, StorageBackend::Secret, "default")
            .build_state()
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::Observation(_)));
    }

    #[tokio::test]
    async fn test_managed_release_keys_dedupes() {
        let mock = MockRunner::new();
        mock.on(
            "kubectl get configmap --all-namespaces",
            CommandOutput::ok(
                r#"{"items":[
                  {"metadata":{"namespace":"staging","labels":{"name":"grafana","version":"1"}}},
                  {"metadata":{"namespace":"staging","labels":{"name":"grafana","version":"2"}}},
                  {"metadata":{"namespace":"staging","labels":{"name":"jenkins"}}}
                ]}"#,
            ),
        );
        let keys = Observer::new(&mock, StorageBackend::ConfigMap, "default")
            .managed_release_keys()
            .await
            .unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&ReleaseKey::new("grafana", "staging")));
        assert_eq!(
            mock.command_lines()[0],
            "kubectl get configmap --all-namespaces -l MANAGED-BY=HELMSMAN,HELMSMAN_CONTEXT=default -o json"
        );
    }
}
