//! Chart resolution: concrete versions for every release about to be considered

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt, TryStreamExt};
use helmsman_core::chart::is_version_constraint;
use helmsman_core::{ChartInfo, ChartMetadata, Release, RunFlags, State, version_matches};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandRunner};
use crate::error::{KubeError, Result};
use crate::ops::ReleaseOps;

/// Resolved chart identity per app label
pub type ChartCache = BTreeMap<String, ChartInfo>;

#[derive(Debug, Deserialize)]
struct SearchHit {
    name: String,
    version: String,
}

/// Resolves chart versions through Chart.yaml, `helm search repo` or `helm show chart`
pub struct ChartResolver<'a> {
    runner: &'a dyn CommandRunner,
    flags: &'a RunFlags,
    /// Destination for `--download-charts`
    download_dir: Option<&'a Path>,
}

impl<'a> ChartResolver<'a> {
    pub fn new(runner: &'a dyn CommandRunner, flags: &'a RunFlags) -> Self {
        Self {
            runner,
            flags,
            download_dir: None,
        }
    }

    pub fn with_download_dir(mut self, dir: &'a Path) -> Self {
        self.download_dir = Some(dir);
        self
    }

    /// Replace each enabled, selected release's version with a concrete one
    pub async fn resolve(&self, state: &mut State) -> Result<ChartCache> {
        let wanted: Vec<(String, Release)> = state
            .apps
            .iter()
            .filter(|(_, r)| r.is_enabled() && !r.ignored)
            .map(|(label, r)| (label.clone(), r.clone()))
            .collect();

        if self.flags.update_deps {
            let ops = ReleaseOps::new(self.flags, &state.settings, state.context());
            for (_, release) in wanted.iter().filter(|(_, r)| r.is_local_chart()) {
                self.runner.run_checked(&ops.dependency_update(&release.chart)).await?;
            }
        }

        let mut requests: BTreeMap<(String, String), Release> = BTreeMap::new();
        for (_, release) in &wanted {
            requests
                .entry((release.chart.clone(), release.version.clone()))
                .or_insert_with(|| release.clone());
        }

        let resolved: BTreeMap<(String, String), ChartInfo> = stream::iter(requests)
            .map(|(key, release)| async move { self.resolve_one(&release).await.map(|info| (key, info)) })
            .buffer_unordered(self.flags.workers())
            .try_collect()
            .await?;

        let mut cache = ChartCache::new();
        for (label, release) in wanted {
            let Some(info) = resolved.get(&(release.chart.clone(), release.version.clone())) else {
                continue;
            };
            if self.flags.check_for_chart_updates && !release.is_local_chart() {
                self.check_for_update(&release).await;
            }
            if let Some(app) = state.apps.get_mut(&label) {
                app.version = info.version.clone();
                if self.flags.download_charts && !app.is_local_chart() {
                    app.chart = self.download(&label, app).await?.display().to_string();
                }
            }
            cache.insert(label, info.clone());
        }
        Ok(cache)
    }

    async fn resolve_one(&self, release: &Release) -> Result<ChartInfo> {
        let info = if release.is_local_chart() {
            self.resolve_local(release)?
        } else if release.is_oci_chart() {
            self.resolve_oci(release).await?
        } else {
            self.resolve_remote(release).await?
        };
        debug!(
            "Resolved chart [ {} ] version [ {} ] to [ {}-{} ]",
            release.chart, release.version, info.name, info.version
        );
        Ok(info)
    }

    fn resolve_local(&self, release: &Release) -> Result<ChartInfo> {
        let meta = ChartMetadata::from_dir(Path::new(&release.chart))?;
        let matches = if release.version.is_empty() {
            true
        } else {
            version_matches(&release.version, &meta.version)?
        };
        if !matches {
            return Err(KubeError::ChartResolution {
                chart: release.chart.clone(),
                version: release.version.clone(),
                message: format!("local chart declares version {}", meta.version),
            });
        }
        Ok(meta.info())
    }

    async fn resolve_oci(&self, release: &Release) -> Result<ChartInfo> {
        let cmd = Command::helm()
            .args(["show", "chart", release.chart.as_str(), "--version", release.version.as_str()])
            .describe(format!("Reading metadata of chart [ {} ]", release.chart));
        let out = self.runner.run(&cmd).await;
        if !out.success() {
            return Err(KubeError::ChartResolution {
                chart: release.chart.clone(),
                version: release.version.clone(),
                message: out.stderr.trim().to_string(),
            });
        }
        Ok(ChartMetadata::from_yaml(&out.stdout, Path::new(&release.chart))?.info())
    }

    async fn resolve_remote(&self, release: &Release) -> Result<ChartInfo> {
        let hits = self.search(&release.chart, Some(&release.version)).await?;
        hits.into_iter()
            .find(|hit| {
                hit.name == release.chart
                    && version_matches(&release.version, &hit.version).unwrap_or(false)
            })
            .map(|hit| ChartInfo {
                name: release.chart_name().to_string(),
                version: hit.version,
            })
            .ok_or_else(|| KubeError::ChartResolution {
                chart: release.chart.clone(),
                version: release.version.clone(),
                message: "no matching version found in the repository".to_string(),
            })
    }

    async fn search(&self, chart: &str, version: Option<&str>) -> Result<Vec<SearchHit>> {
        let mut cmd = Command::helm().args(["search", "repo", chart]);
        if let Some(version) = version {
            cmd = cmd.args(["--version", version]);
        }
        let cmd = cmd
            .args(["--output", "json"])
            .describe(format!("Searching repositories for chart [ {} ]", chart));
        let out = self.runner.run(&cmd).await;
        if !out.success() {
            return Err(KubeError::ChartResolution {
                chart: chart.to_string(),
                version: version.unwrap_or_default().to_string(),
                message: out.stderr.trim().to_string(),
            });
        }
        if out.stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&out.stdout)?)
    }

    /// Warn when the repository has a newer version than the pinned one
    async fn check_for_update(&self, release: &Release) {
        if release.is_oci_chart() || is_version_constraint(&release.version) {
            return;
        }
        let latest = match self.search(&release.chart, None).await {
            Ok(hits) => hits.into_iter().find(|h| h.name == release.chart),
            Err(e) => {
                warn!("Could not check for updates of chart [ {} ]: {}", release.chart, e);
                return;
            }
        };
        let Some(latest) = latest else { return };
        let newer = match (
            semver::Version::parse(latest.version.trim_start_matches('v')),
            semver::Version::parse(release.version.trim_start_matches('v')),
        ) {
            (Ok(latest), Ok(pinned)) => latest > pinned,
            _ => latest.version != release.version,
        };
        if newer {
            warn!(
                "Newer version [ {} ] of chart [ {} ] is available, currently pinned to [ {} ]",
                latest.version, release.chart, release.version
            );
        }
    }

    /// `helm pull --untar` into the download dir; returns the local chart path
    async fn download(&self, label: &str, release: &Release) -> Result<PathBuf> {
        let Some(root) = self.download_dir else {
            return Err(KubeError::Environment(
                "no download directory configured for --download-charts".to_string(),
            ));
        };
        let dest = root.join(label);
        std::fs::create_dir_all(&dest)?;
        let dest_str = dest.display().to_string();
        let cmd = Command::helm()
            .args(["pull", release.chart.as_str(), "--version", release.version.as_str()])
            .args(["--untar", "--untardir", dest_str.as_str()])
            .describe(format!("Downloading chart [ {} ]", release.chart));
        self.runner.run_checked(&cmd).await?;
        let local = dest.join(release.chart_name());
        info!("Downloaded chart [ {} ] to {}", release.chart, local.display());
        Ok(local)
    }
}
