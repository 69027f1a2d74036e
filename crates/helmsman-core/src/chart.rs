//! Chart identity: observed chart labels, local `Chart.yaml` metadata and version constraints

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

static CHART_VERSION_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"-(v?\d+\.\d+\.\d+[-+A-Za-z0-9.]*)$").expect("valid chart version regex")
});

/// Resolved chart name and concrete version of a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartInfo {
    pub name: String,
    pub version: String,
}

/// Split a `helm list` chart label such as `cert-manager-v0.5.2` into name and version
///
/// Labels without a version suffix yield an empty version.
pub fn parse_chart_label(label: &str) -> (String, String) {
    match CHART_VERSION_SUFFIX.captures(label) {
        Some(caps) => {
            let start = caps.get(0).map(|m| m.start()).unwrap_or(label.len());
            (label[..start].to_string(), caps[1].to_string())
        }
        None => (label.to_string(), String::new()),
    }
}

/// The subset of `Chart.yaml` the engine cares about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub app_version: Option<String>,
}

impl ChartMetadata {
    /// Read `Chart.yaml` from a chart directory
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join("Chart.yaml");
        let content = std::fs::read_to_string(&path).map_err(|e| CoreError::read(&path, e))?;
        Self::from_yaml(&content, &path)
    }

    pub fn from_yaml(content: &str, origin: &Path) -> Result<Self> {
        let meta: ChartMetadata =
            serde_yaml::from_str(content).map_err(|e| CoreError::ChartMetadata {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;
        if meta.name.is_empty() || meta.version.is_empty() {
            return Err(CoreError::ChartMetadata {
                path: origin.to_path_buf(),
                message: "name and version are required".to_string(),
            });
        }
        Ok(meta)
    }

    pub fn info(&self) -> ChartInfo {
        ChartInfo {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }
}

fn parse_version(raw: &str) -> Option<Version> {
    Version::parse(raw.trim().trim_start_matches('v')).ok()
}

/// True when `raw` is a constraint rather than a single exact version
pub fn is_version_constraint(raw: &str) -> bool {
    parse_version(raw).is_none()
}

/// Parse a Helm-style constraint (`>=1.0 <2.0`, `^1.2`, `1.x || 2.x`)
fn parse_constraint(raw: &str) -> Result<Vec<VersionReq>> {
    raw.split("||")
        .map(|alternative| {
            let normalized = alternative
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>();
            // "> 1.0" style: re-attach bare operators to the version that follows
            let mut comparators: Vec<String> = Vec::new();
            for part in normalized {
                match comparators.last_mut() {
                    Some(last) if last.chars().all(|c| "<>=~^!".contains(c)) => last.push_str(part),
                    _ => comparators.push(part.trim_start_matches('v').to_string()),
                }
            }
            VersionReq::parse(&comparators.join(", ")).map_err(CoreError::from)
        })
        .collect()
}

/// Whether `version` satisfies `constraint`; exact versions compare literally
pub fn version_matches(constraint: &str, version: &str) -> Result<bool> {
    if !is_version_constraint(constraint) {
        return Ok(match (parse_version(constraint), parse_version(version)) {
            (Some(a), Some(b)) => a == b,
            _ => constraint.trim() == version.trim(),
        });
    }
    let Some(version) = parse_version(version) else {
        return Ok(false);
    };
    Ok(parse_constraint(constraint)?
        .iter()
        .any(|req| req.matches(&version)))
}
