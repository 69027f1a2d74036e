//! Release lifecycle hooks
//!
//! A hook slot holds one string in the DSF. It is classified once, at load time,
//! into a [`HookAction`]:
//! - a URL (`http://`, `https://`) to a raw manifest, applied with `kubectl apply -f`
//! - a local manifest (`.yaml`, `.yml`, `.json`), applied with `kubectl apply -f`
//! - anything else is an executable command line, run as-is
//!
//! `successCondition`, `successTimeout` and `deleteOnSuccess` are control
//! settings shared by every manifest hook of the release.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::merge_fields;

/// Default time to wait for a manifest hook's success condition
pub const DEFAULT_SUCCESS_TIMEOUT: &str = "30s";

const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// When a hook runs relative to its trigger action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookKind {
    PreInstall,
    PostInstall,
    PreUpgrade,
    PostUpgrade,
    PreDelete,
    PostDelete,
    Test,
}

impl HookKind {
    pub const ALL: [HookKind; 7] = [
        HookKind::PreInstall,
        HookKind::PostInstall,
        HookKind::PreUpgrade,
        HookKind::PostUpgrade,
        HookKind::PreDelete,
        HookKind::PostDelete,
        HookKind::Test,
    ];

    /// DSF key of this hook slot
    pub fn key(&self) -> &'static str {
        match self {
            HookKind::PreInstall => "preInstall",
            HookKind::PostInstall => "postInstall",
            HookKind::PreUpgrade => "preUpgrade",
            HookKind::PostUpgrade => "postUpgrade",
            HookKind::PreDelete => "preDelete",
            HookKind::PostDelete => "postDelete",
            HookKind::Test => "test",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// What a hook slot does when triggered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookAction {
    /// Local manifest applied with kubectl
    Manifest(PathBuf),
    /// Remote raw manifest applied with kubectl
    Url(String),
    /// Arbitrary command line
    Exec(Vec<String>),
}

impl HookAction {
    /// Classify a raw hook value
    pub fn classify(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Some(Self::Url(raw.to_string()));
        }
        if is_manifest_path(raw) {
            return Some(Self::Manifest(PathBuf::from(raw)));
        }
        Some(Self::Exec(raw.split_whitespace().map(String::from).collect()))
    }

    /// Check the hook can run on this machine
    pub fn check(&self) -> std::result::Result<(), String> {
        match self {
            Self::Manifest(path) => {
                if path.is_file() {
                    Ok(())
                } else {
                    Err(format!("manifest '{}' is not a readable file", path.display()))
                }
            }
            Self::Url(raw) => url::Url::parse(raw)
                .map(|_| ())
                .map_err(|e| format!("invalid manifest URL '{}': {}", raw, e)),
            Self::Exec(argv) => {
                let program = argv.first().map(String::as_str).unwrap_or_default();
                if resolve_executable(program).is_some() {
                    Ok(())
                } else {
                    Err(format!("'{}' is neither a manifest file nor an executable on PATH", program))
                }
            }
        }
    }

    /// The `-f` argument for manifest hooks
    pub fn manifest_source(&self) -> Option<String> {
        match self {
            Self::Manifest(path) => Some(path.display().to_string()),
            Self::Url(url) => Some(url.clone()),
            Self::Exec(_) => None,
        }
    }
}

/// Control settings applying to all manifest hooks of a release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookControl {
    pub success_condition: Option<String>,
    pub success_timeout: String,
    pub delete_on_success: bool,
}

/// Hook slots as written in the DSF
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_install: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_install: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_upgrade: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_upgrade: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_delete: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_delete: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_on_success: Option<bool>,
}

merge_fields!(Hooks {
    pre_install,
    post_install,
    pre_upgrade,
    post_upgrade,
    pre_delete,
    post_delete,
    test,
    success_condition,
    success_timeout,
    delete_on_success,
});

impl Hooks {
    fn slot(&self, kind: HookKind) -> &Option<String> {
        match kind {
            HookKind::PreInstall => &self.pre_install,
            HookKind::PostInstall => &self.post_install,
            HookKind::PreUpgrade => &self.pre_upgrade,
            HookKind::PostUpgrade => &self.post_upgrade,
            HookKind::PreDelete => &self.pre_delete,
            HookKind::PostDelete => &self.post_delete,
            HookKind::Test => &self.test,
        }
    }

    fn slot_mut(&mut self, kind: HookKind) -> &mut Option<String> {
        match kind {
            HookKind::PreInstall => &mut self.pre_install,
            HookKind::PostInstall => &mut self.post_install,
            HookKind::PreUpgrade => &mut self.pre_upgrade,
            HookKind::PostUpgrade => &mut self.post_upgrade,
            HookKind::PreDelete => &mut self.pre_delete,
            HookKind::PostDelete => &mut self.post_delete,
            HookKind::Test => &mut self.test,
        }
    }

    /// Raw value of a hook slot, if set and non-blank
    pub fn get(&self, kind: HookKind) -> Option<&str> {
        self.slot(kind)
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Classified action for a hook slot
    pub fn action(&self, kind: HookKind) -> Option<HookAction> {
        self.get(kind).and_then(HookAction::classify)
    }

    /// Iterate over every populated slot
    pub fn actions(&self) -> impl Iterator<Item = (HookKind, HookAction)> + '_ {
        HookKind::ALL
            .into_iter()
            .filter_map(|kind| self.action(kind).map(|a| (kind, a)))
    }

    pub fn is_default(&self) -> bool {
        *self == Hooks::default()
    }

    pub fn is_empty(&self) -> bool {
        HookKind::ALL.iter().all(|k| self.get(*k).is_none())
    }

    pub fn control(&self) -> HookControl {
        HookControl {
            success_condition: self
                .success_condition
                .clone()
                .filter(|c| !c.trim().is_empty()),
            success_timeout: self
                .success_timeout
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SUCCESS_TIMEOUT.to_string()),
            delete_on_success: self.delete_on_success.unwrap_or(false),
        }
    }

    /// Fill empty slots and unset control settings from global hooks
    pub fn inherit(&mut self, global: &Hooks) {
        for kind in HookKind::ALL {
            if self.get(kind).is_none() {
                if let Some(value) = global.get(kind) {
                    *self.slot_mut(kind) = Some(value.to_string());
                }
            }
        }
        if self.success_condition.is_none() {
            self.success_condition = global.success_condition.clone();
        }
        if self.success_timeout.is_none() {
            self.success_timeout = global.success_timeout.clone();
        }
        if self.delete_on_success.is_none() {
            self.delete_on_success = global.delete_on_success;
        }
    }

    /// Make relative manifest and script paths absolute against `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        for kind in HookKind::ALL {
            let slot = self.slot_mut(kind);
            let Some(raw) = slot.as_deref() else { continue };
            let resolved = match HookAction::classify(raw) {
                Some(HookAction::Manifest(path)) if path.is_relative() => {
                    Some(base.join(path).display().to_string())
                }
                Some(HookAction::Exec(mut argv)) if is_relative_script(&argv[0]) => {
                    argv[0] = base.join(&argv[0]).display().to_string();
                    Some(argv.join(" "))
                }
                _ => None,
            };
            if let Some(resolved) = resolved {
                *slot = Some(resolved);
            }
        }
    }
}

fn is_manifest_path(raw: &str) -> bool {
    if raw.contains(char::is_whitespace) {
        return false;
    }
    Path::new(raw)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| MANIFEST_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_relative_script(program: &str) -> bool {
    program.starts_with("./") || program.starts_with("../")
}

/// Locate an executable, either by explicit path or on `PATH`
pub fn resolve_executable(program: &str) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }
    if program.contains('/') {
        let path = PathBuf::from(program);
        return path.is_file().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_hook_values() {
        assert_eq!(
            HookAction::classify("jobs/migrate.yaml"),
            Some(HookAction::Manifest(PathBuf::from("jobs/migrate.yaml")))
        );
        assert_eq!(
            HookAction::classify("https://example.com/crds.yaml"),
            Some(HookAction::Url("https://example.com/crds.yaml".to_string()))
        );
        assert_eq!(
            HookAction::classify("sh -c 'echo hi'"),
            Some(HookAction::Exec(vec![
                "sh".to_string(),
                "-c".to_string(),
                "'echo".to_string(),
                "hi'".to_string()
            ]))
        );
        assert_eq!(HookAction::classify("   "), None);
    }

    #[test]
    fn test_inherit_keeps_release_slots() {
        let mut hooks = Hooks {
            pre_install: Some("local.yaml".to_string()),
            ..Default::default()
        };
        let global = Hooks {
            pre_install: Some("global.yaml".to_string()),
            post_install: Some("global-post.yaml".to_string()),
            success_condition: Some("Complete".to_string()),
            ..Default::default()
        };

        hooks.inherit(&global);

        assert_eq!(hooks.get(HookKind::PreInstall), Some("local.yaml"));
        assert_eq!(hooks.get(HookKind::PostInstall), Some("global-post.yaml"));
        assert_eq!(hooks.control().success_condition.as_deref(), Some("Complete"));
    }

    #[test]
    fn test_control_defaults() {
        let control = Hooks::default().control();
        assert_eq!(control.success_timeout, DEFAULT_SUCCESS_TIMEOUT);
        assert!(!control.delete_on_success);
        assert!(control.success_condition.is_none());
    }

    #[test]
    fn test_resolve_paths() {
        let mut hooks = Hooks {
            pre_install: Some("hooks/job.yaml".to_string()),
            post_install: Some("./scripts/notify.sh --all".to_string()),
            pre_delete: Some("/abs/job.yaml".to_string()),
            ..Default::default()
        };
        hooks.resolve_paths(Path::new("/dsf"));

        assert_eq!(hooks.get(HookKind::PreInstall), Some("/dsf/hooks/job.yaml"));
        assert_eq!(
            hooks.get(HookKind::PostInstall),
            Some("/dsf/./scripts/notify.sh --all")
        );
        assert_eq!(hooks.get(HookKind::PreDelete), Some("/abs/job.yaml"));
    }

    #[test]
    fn test_exec_check_uses_path() {
        let action = HookAction::Exec(vec!["definitely-not-a-real-tool-xyz".to_string()]);
        assert!(action.check().is_err());
    }
}
