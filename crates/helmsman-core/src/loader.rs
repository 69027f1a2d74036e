//! Desired state file (DSF) loading and merging
//!
//! Loading a run's desired state happens in stages:
//! 1. each file is read, substituted (env, SSM) and strictly decoded
//! 2. relative paths are made absolute against the file's directory and
//!    object-store certificates are downloaded
//! 3. files are merged in ascending priority, later files overriding earlier ones
//! 4. app templates are expanded, names defaulted and global hooks inherited
//! 5. overrides and the target/group selection are applied

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::flags::RunFlags;
use crate::merge::Merge;
use crate::release::Release;
use crate::state::{Selection, State};
use crate::subst::{self, ParameterStore};

const BLOB_SCHEMES: &[&str] = &["s3://", "gs://", "az://"];

/// A DSF path tagged with its merge priority (lower merges first)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateFile {
    pub path: PathBuf,
    pub priority: i32,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>, priority: i32) -> Self {
        Self {
            path: path.into(),
            priority,
        }
    }
}

/// Downloads object-store URIs (`s3://`, `gs://`, `az://`) to a local directory
pub trait BlobFetcher: Send + Sync {
    fn fetch(&self, uri: &str, dest_dir: &Path) -> std::result::Result<PathBuf, String>;
}

pub fn is_blob_uri(raw: &str) -> bool {
    BLOB_SCHEMES.iter().any(|scheme| raw.starts_with(scheme))
}

/// Loads and merges DSF files into one [`State`]
pub struct Loader<'a> {
    flags: &'a RunFlags,
    work_dir: &'a Path,
    selection: Selection,
    blob_fetcher: Option<&'a dyn BlobFetcher>,
    parameter_store: Option<&'a dyn ParameterStore>,
}

impl<'a> Loader<'a> {
    /// `work_dir` receives downloaded certificates and substituted values files
    pub fn new(flags: &'a RunFlags, work_dir: &'a Path) -> Self {
        Self {
            flags,
            work_dir,
            selection: Selection::default(),
            blob_fetcher: None,
            parameter_store: None,
        }
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_blob_fetcher(mut self, fetcher: &'a dyn BlobFetcher) -> Self {
        self.blob_fetcher = Some(fetcher);
        self
    }

    pub fn with_parameter_store(mut self, store: &'a dyn ParameterStore) -> Self {
        self.parameter_store = Some(store);
        self
    }

    /// Load, merge and post-process the given files
    pub fn load(&self, files: &[StateFile]) -> Result<State> {
        let mut ordered: Vec<&StateFile> = files.iter().collect();
        ordered.sort_by_key(|f| f.priority);

        let mut state = State::default();
        for file in ordered {
            let fragment = self.load_file(&file.path)?;
            info!(
                "Parsed [[ {} ]] successfully and found [ {} ] apps",
                file.path.display(),
                fragment.apps.len()
            );
            state.merge(fragment);
        }

        expand_templates(&mut state)?;
        self.finalize(&mut state)?;
        Ok(state)
    }

    fn load_file(&self, path: &Path) -> Result<State> {
        let raw = std::fs::read_to_string(path).map_err(|e| CoreError::read(path, e))?;
        let text = self.substitute(&raw, path)?;
        let mut state = decode(&text, path)?;

        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let base = if base.as_os_str().is_empty() {
            std::env::current_dir()?
        } else if base.is_relative() {
            std::env::current_dir()?.join(base)
        } else {
            base
        };
        self.expand_paths(&mut state, &base)?;
        Ok(state)
    }

    fn substitute(&self, text: &str, path: &Path) -> Result<String> {
        let mut text = if self.flags.env_subst {
            subst::expand_process_env(text, path, self.flags.recursive_env_expand)?
        } else {
            text.to_string()
        };
        if self.flags.ssm_subst {
            if let Some(store) = self.parameter_store {
                text = subst::expand_ssm(&text, path, store)?;
            }
        }
        Ok(text)
    }

    fn expand_paths(&self, state: &mut State, base: &Path) -> Result<()> {
        for release in state
            .apps
            .values_mut()
            .chain(state.apps_templates.values_mut())
        {
            expand_release_paths(release, base);
        }

        let settings = &mut state.settings;
        settings.bearer_token_path = resolve_path(base, &settings.bearer_token_path);
        settings.eyaml_private_key_path = resolve_path(base, &settings.eyaml_private_key_path);
        settings.eyaml_public_key_path = resolve_path(base, &settings.eyaml_public_key_path);
        settings.global_hooks.resolve_paths(base);

        for (name, location) in state.certificates.iter_mut() {
            if is_blob_uri(location) {
                let fetcher = self.blob_fetcher.ok_or_else(|| CoreError::Download {
                    uri: location.clone(),
                    message: "no object-store fetcher configured".to_string(),
                })?;
                let local = fetcher
                    .fetch(location, self.work_dir)
                    .map_err(|message| CoreError::Download {
                        uri: location.clone(),
                        message,
                    })?;
                debug!("Downloaded certificate {} to {}", name, local.display());
                *location = local.display().to_string();
            } else {
                *location = resolve_path(base, location);
            }
        }
        Ok(())
    }

    fn finalize(&self, state: &mut State) -> Result<()> {
        if let Some(context) = &self.flags.context_override {
            info!("Overriding managing context with [ {} ]", context);
            state.context = context.clone();
        }

        let global_hooks = state.settings.global_hooks.clone();
        for (label, release) in state.apps.iter_mut() {
            if release.name.is_empty() {
                release.name = label.clone();
            }
            if let Some(ns) = &self.flags.ns_override {
                release.namespace = ns.clone();
            }
            release.hooks.inherit(&global_hooks);
        }

        if self.flags.subst_env_values || self.flags.subst_ssm_values {
            self.substitute_values_files(state)?;
        }

        state.apply_selection(self.selection.clone());
        Ok(())
    }

    /// Copy values files into the work dir with substitution applied
    fn substitute_values_files(&self, state: &mut State) -> Result<()> {
        for (label, release) in state.apps.iter_mut() {
            if !release.values_file.is_empty() {
                release.values_file = self.substitute_values_file(label, 0, &release.values_file)?;
            }
            for (idx, file) in release.values_files.iter_mut().enumerate() {
                *file = self.substitute_values_file(label, idx + 1, file)?;
            }
        }
        Ok(())
    }

    fn substitute_values_file(&self, label: &str, idx: usize, file: &str) -> Result<String> {
        let source = Path::new(file);
        let raw = std::fs::read_to_string(source).map_err(|e| CoreError::read(source, e))?;
        let mut text = raw;
        if self.flags.subst_env_values {
            text = subst::expand_process_env(&text, source, self.flags.recursive_env_expand)?;
        }
        if self.flags.subst_ssm_values {
            if let Some(store) = self.parameter_store {
                text = subst::expand_ssm(&text, source, store)?;
            }
        }
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "values.yaml".to_string());
        let target = self.work_dir.join(format!("{}-{}-{}", label, idx, file_name));
        std::fs::write(&target, text)?;
        Ok(target.display().to_string())
    }
}

/// Strictly decode one DSF; the extension selects TOML or YAML/JSON
pub fn decode(text: &str, path: &Path) -> Result<State> {
    let parse_err = |message: String| CoreError::Parse {
        path: path.to_path_buf(),
        message,
    };
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));

    if is_toml {
        return toml::from_str(text).map_err(|e| parse_err(e.to_string()));
    }

    let mut value: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|e| parse_err(e.to_string()))?;
    if value.is_null() {
        return Ok(State::default());
    }
    value.apply_merge().map_err(|e| parse_err(e.to_string()))?;
    serde_yaml::from_value(value).map_err(|e| parse_err(e.to_string()))
}

fn expand_release_paths(release: &mut Release, base: &Path) {
    release.chart = resolve_chart(base, &release.chart);
    release.values_file = resolve_path(base, &release.values_file);
    release.secrets_file = resolve_path(base, &release.secrets_file);
    for file in release
        .values_files
        .iter_mut()
        .chain(release.secrets_files.iter_mut())
        .chain(release.set_file.values_mut())
    {
        *file = resolve_path(base, file);
    }
    if release.post_renderer.contains('/') {
        release.post_renderer = resolve_path(base, &release.post_renderer);
    }
    release.hooks.resolve_paths(base);
}

/// Make a relative file path absolute; URLs and object-store URIs are kept
fn resolve_path(base: &Path, raw: &str) -> String {
    if raw.is_empty() || raw.contains("://") || Path::new(raw).is_absolute() {
        return raw.to_string();
    }
    base.join(raw).display().to_string()
}

/// Local chart references become absolute paths; `repo/name` and `oci://` stay as-is
fn resolve_chart(base: &Path, chart: &str) -> String {
    if chart.is_empty() || chart.contains("://") || Path::new(chart).is_absolute() {
        return chart.to_string();
    }
    let explicit = chart.starts_with("./") || chart.starts_with("../");
    let candidate = base.join(chart);
    if explicit || candidate.is_dir() {
        candidate.display().to_string()
    } else {
        chart.to_string()
    }
}

/// Apply `appsTemplates` defaults to every app referencing a template
pub fn expand_templates(state: &mut State) -> Result<()> {
    let mut resolved: BTreeMap<String, Release> = BTreeMap::new();
    let names: Vec<String> = state.apps_templates.keys().cloned().collect();
    for name in names {
        let mut stack = Vec::new();
        resolve_template(&name, &state.apps_templates, &mut resolved, &mut stack)?;
    }

    for (label, app) in state.apps.iter_mut() {
        if app.template.is_empty() {
            continue;
        }
        let Some(template) = resolved.get(&app.template) else {
            return Err(CoreError::Template {
                entity: format!("apps.{}", label),
                message: format!("unknown template '{}'", app.template),
            });
        };
        let mut merged = template.clone();
        merged.merge(std::mem::take(app));
        *app = merged;
    }
    Ok(())
}

fn resolve_template(
    name: &str,
    templates: &BTreeMap<String, Release>,
    resolved: &mut BTreeMap<String, Release>,
    stack: &mut Vec<String>,
) -> Result<Release> {
    if let Some(done) = resolved.get(name) {
        return Ok(done.clone());
    }
    if stack.iter().any(|s| s == name) {
        stack.push(name.to_string());
        return Err(CoreError::Template {
            entity: format!("appsTemplates.{}", name),
            message: format!("cyclic template inheritance: {}", stack.join(" -> ")),
        });
    }
    let template = templates.get(name).ok_or_else(|| CoreError::Template {
        entity: stack
            .last()
            .map(|parent| format!("appsTemplates.{}", parent))
            .unwrap_or_else(|| "appsTemplates".to_string()),
        message: format!("unknown template '{}'", name),
    })?;

    stack.push(name.to_string());
    let mut base = if template.template.is_empty() {
        Release::default()
    } else {
        resolve_template(&template.template, templates, resolved, stack)?
    };
    stack.pop();

    base.merge(template.clone());
    resolved.insert(name.to_string(), base.clone());
    Ok(base)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SpecFile {
    #[serde(default)]
    state_files: Vec<SpecEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SpecEntry {
    path: String,
}

/// Read a composition file listing `stateFiles`, in merge order
pub fn read_spec_file(path: &Path) -> Result<Vec<StateFile>> {
    let text = std::fs::read_to_string(path).map_err(|e| CoreError::read(path, e))?;
    let spec: SpecFile = serde_yaml::from_str(&text).map_err(|e| CoreError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(spec
        .state_files
        .into_iter()
        .enumerate()
        .map(|(idx, entry)| StateFile::new(base.join(entry.path), idx as i32))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookKind;
    use std::fs;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    fn no_subst() -> RunFlags {
        RunFlags {
            env_subst: false,
            ssm_subst: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_by_priority() {
        let dir = tempfile::tempdir().unwrap();
        let base = write(
            dir.path(),
            "base.yaml",
            r#"
namespaces:
  staging: {}
apps:
  jenkins:
    namespace: staging
    chart: stable/jenkins
    version: 0.9.0
    enabled: true
    set:
      a: "1"
"#,
        );
        let overlay = write(
            dir.path(),
            "overlay.toml",
            r#"
[apps.jenkins]
version = "0.9.1"

[apps.jenkins.set]
b = "2"
"#,
        );
        let flags = no_subst();
        let work = tempfile::tempdir().unwrap();
        // overlay listed first but with the higher priority
        let state = Loader::new(&flags, work.path())
            .load(&[StateFile::new(&overlay, 1), StateFile::new(&base, 0)])
            .unwrap();

        let jenkins = &state.apps["jenkins"];
        assert_eq!(jenkins.version, "0.9.1");
        assert_eq!(jenkins.enabled, Some(true));
        assert_eq!(jenkins.name, "jenkins");
        assert_eq!(jenkins.set["a"], "1");
        assert_eq!(jenkins.set["b"], "2");
    }

    #[test]
    fn test_unknown_key_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "bad.yaml", "apps:\n  x:\n    chartt: foo\n");
        let flags = no_subst();
        let err = Loader::new(&flags, dir.path())
            .load(&[StateFile::new(&file, 0)])
            .unwrap_err();
        assert!(matches!(err, CoreError::Parse { .. }), "{err}");
    }

    #[test]
    fn test_relative_paths_resolved() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "charts/my-app/Chart.yaml", "name: my-app\nversion: 1.0.0\n");
        let file = write(
            dir.path(),
            "dsf/main.yaml",
            r#"
apps:
  app:
    namespace: default
    chart: ../charts/my-app
    version: 1.0.0
    valuesFile: values/app.yaml
    hooks:
      preInstall: hooks/job.yaml
"#,
        );
        let flags = no_subst();
        let state = Loader::new(&flags, dir.path())
            .load(&[StateFile::new(&file, 0)])
            .unwrap();
        let app = &state.apps["app"];
        let dsf_dir = dir.path().join("dsf");
        assert_eq!(app.chart, dsf_dir.join("../charts/my-app").display().to_string());
        assert!(app.is_local_chart());
        assert_eq!(
            app.values_file,
            dsf_dir.join("values/app.yaml").display().to_string()
        );
        assert_eq!(
            app.hooks.get(HookKind::PreInstall),
            Some(dsf_dir.join("hooks/job.yaml").display().to_string().as_str())
        );
    }

    #[test]
    fn test_templates_and_cycles() {
        let mut state = State::default();
        state.apps_templates.insert(
            "base".to_string(),
            Release {
                namespace: "staging".to_string(),
                enabled: Some(true),
                priority: Some(-5),
                ..Default::default()
            },
        );
        state.apps_templates.insert(
            "ci".to_string(),
            Release {
                template: "base".to_string(),
                group: "ci".to_string(),
                ..Default::default()
            },
        );
        state.apps.insert(
            "jenkins".to_string(),
            Release {
                template: "ci".to_string(),
                chart: "stable/jenkins".to_string(),
                priority: Some(-1),
                ..Default::default()
            },
        );

        expand_templates(&mut state).unwrap();
        let jenkins = &state.apps["jenkins"];
        assert_eq!(jenkins.namespace, "staging");
        assert_eq!(jenkins.group, "ci");
        assert_eq!(jenkins.priority, Some(-1));
        assert_eq!(jenkins.enabled, Some(true));

        state.apps_templates.get_mut("base").unwrap().template = "ci".to_string();
        let err = expand_templates(&mut state).unwrap_err();
        assert!(err.to_string().contains("cyclic"), "{err}");
    }

    #[test]
    fn test_yaml_anchors_merge() {
        let state = decode(
            r#"
appsTemplates:
  default: &default
    namespace: staging
    enabled: true
apps:
  jenkins:
    <<: *default
    chart: stable/jenkins
    version: 1.0.0
"#,
            Path::new("dsf.yaml"),
        )
        .unwrap();
        assert_eq!(state.apps["jenkins"].namespace, "staging");
        assert_eq!(state.apps["jenkins"].enabled, Some(true));
    }

    #[test]
    fn test_ns_override_and_selection() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(
            dir.path(),
            "dsf.yaml",
            r#"
apps:
  jenkins: {namespace: staging, chart: stable/jenkins, version: 1.0.0, enabled: true, group: ci}
  grafana: {namespace: monitoring, chart: stable/grafana, version: 1.0.0, enabled: true}
"#,
        );
        let flags = RunFlags {
            ns_override: Some("sandbox".to_string()),
            ..no_subst()
        };
        let state = Loader::new(&flags, dir.path())
            .with_selection(Selection {
                groups: ["ci".to_string()].into(),
                ..Default::default()
            })
            .load(&[StateFile::new(&file, 0)])
            .unwrap();

        assert_eq!(state.apps["jenkins"].namespace, "sandbox");
        assert!(!state.apps["jenkins"].ignored);
        assert!(state.apps["grafana"].ignored);
    }

    #[test]
    fn test_spec_file() {
        let dir = tempfile::tempdir().unwrap();
        let spec = write(
            dir.path(),
            "spec.yaml",
            "stateFiles:\n  - path: base.yaml\n  - path: prod/overrides.yaml\n",
        );
        let files = read_spec_file(&spec).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, dir.path().join("base.yaml"));
        assert_eq!(files[1].priority, 1);
    }

    struct StaticFetcher;

    impl BlobFetcher for StaticFetcher {
        fn fetch(&self, uri: &str, dest_dir: &Path) -> std::result::Result<PathBuf, String> {
            let name = uri.rsplit('/').next().unwrap_or("blob");
            let path = dest_dir.join(name);
            fs::write(&path, "cert").map_err(|e| e.to_string())?;
            Ok(path)
        }
    }

    #[test]
    fn test_certificates_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let file = write(
            dir.path(),
            "dsf.yaml",
            "certificates:\n  caCrt: s3://bucket/ca.crt\n  caKey: keys/ca.key\n",
        );
        let flags = no_subst();
        let fetcher = StaticFetcher;
        let state = Loader::new(&flags, work.path())
            .with_blob_fetcher(&fetcher)
            .load(&[StateFile::new(&file, 0)])
            .unwrap();
        assert_eq!(
            state.certificates["caCrt"],
            work.path().join("ca.crt").display().to_string()
        );
        assert_eq!(
            state.certificates["caKey"],
            dir.path().join("keys/ca.key").display().to_string()
        );
    }
}
